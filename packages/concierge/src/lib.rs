//! Concierge: the signal dispatcher and journal feed.
//!
//! Wires `controlflow` primitives into a small service:
//! - [`dispatcher`] routes search signals to the search worker and retrieve
//!   signals to the things aggregator
//! - [`feed`] journals accepted signals and tails the journal with a
//!   resumable source
//! - [`workers`] are the downstream handlers

pub mod config;
pub mod dispatcher;
pub mod feed;
pub mod signal;
pub mod workers;

pub use config::ConciergeConfig;
pub use dispatcher::{
    dispatcher_pipeline, dispatcher_pipeline_with_pre_step, reject_empty_retrieve,
    spawn_dispatcher, AGGREGATOR_ACTOR_PATH, DISPATCHER_ACTOR_PATH, SEARCH_ACTOR_PATH,
};
pub use feed::{tail_journal, Journal, JournalEntry, MemoryJournal};
pub use signal::{Reply, ReplyTo, Signal, SignalEnvelope, SignalKind};
pub use workers::{spawn_search_worker, spawn_things_aggregator, WorkerInbox};
