//! # Controlflow
//!
//! In-process control flow for message-routing services: a typed content
//! router that hands messages to the right downstream handler, and a
//! resumable source that keeps a flaky upstream feed alive.
//!
//! ## Core Concepts
//!
//! Two independent primitives that share no runtime state:
//! - [`RoutingPipeline`] = **where a message goes** (first matching stage wins)
//! - [`ResumableSource`] = **how a feed survives failure** (backoff, restart
//!   budget, look-behind seed recomputation)
//!
//! ## Architecture
//!
//! ```text
//!                  Directory ("/user/...")
//!                      ▲ register / send
//!                      │
//! SessionHandle ─► RouterSession ─► RoutingPipeline ─┬─► Stage 0 ─► Destination
//!                   (arrival order)                  ├─► Stage 1 ─► Destination
//!                                                    └─► unmatched ─► next pipeline
//!                                                                     or dead letter
//!
//! upstream ─► resume(seed) ─► ResumableSource ─► consumer
//!                  ▲                │ failure
//!                  │                ▼
//!             next_seed ◄── BackoffScheduler + LookBehindBuffer
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Stage order is fixed** - Registration order decides, first match wins
//! 2. **Routing is fire-and-forget** - The router never waits, queues or retries
//! 3. **Reply channels pass through** - Routing never touches `reply_to`
//! 4. **One sub-stream at a time** - A resumption starts only after the previous
//!    sub-stream is gone
//! 5. **Restart budget is lifetime** - The quiet-period reset only shortens delays
//! 6. **Transient failures stay inside** - Only budget exhaustion reaches the consumer
//!
//! ## Example
//!
//! ```ignore
//! use controlflow::{Directory, Envelope, ResumableSource, ResumeSettings, RouterSession,
//!                   RoutingPipeline, Stage};
//! use futures::StreamExt;
//!
//! // Routing
//! let directory = Directory::new();
//! let pipeline = RoutingPipeline::builder()
//!     .stage(Stage::new("search", directory.destination(SEARCH_PATH))
//!         .tag(SignalKind::ThingSearch)
//!         .tag(SignalKind::SudoThingSearch))
//!     .stage(Stage::new("retrieve", aggregator)
//!         .tag(SignalKind::RetrieveThings)
//!         .tag(SignalKind::SudoRetrieveThings))
//!     .build()?;
//! let (dispatcher, _task) = RouterSession::spawn(pipeline, 1024)?;
//! directory.register(DISPATCHER_PATH, dispatcher)?;
//!
//! // Resuming a feed
//! let mut feed = ResumableSource::builder(0u64)
//!     .settings(&ResumeSettings::from_env("THINGS_FEED")?)
//!     .resume(move |offset| journal.read_from(offset))
//!     .next_seed(|last: Vec<Entry>| last.last().map_or(0, |e| e.seq + 1))
//!     .build()?;
//!
//! while let Some(entry) = feed.next().await {
//!     let entry = entry?;
//!     // ...
//! }
//! ```
//!
//! ## What This Is Not
//!
//! Controlflow is **not**:
//! - A network transport
//! - A durable queue (hand-off to a destination is at-most-once)
//! - An actor framework

// Core modules
mod backoff;
mod config;
mod destination;
mod directory;
mod envelope;
mod error;
mod look_behind;
mod resume;
mod router;
mod session;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export error types
pub use crate::error::FlowError;

// Re-export resumable source types
pub use backoff::{BackoffDecision, BackoffPolicy, BackoffScheduler, BackoffState, RestartBudget};
pub use config::ResumeSettings;
pub use look_behind::LookBehindBuffer;
pub use resume::{FailureRecord, Phase, ResumableSource, ResumableSourceBuilder};

// Re-export routing types
pub use destination::{Consume, Destination};
pub use directory::{Directory, DirectoryDestination};
pub use envelope::{CorrelationId, Envelope, Routable};
pub use router::{Matcher, Routed, RoutingPipeline, RoutingPipelineBuilder, Stage, Step};
pub use session::{RouterSession, SessionHandle, SessionStats};
