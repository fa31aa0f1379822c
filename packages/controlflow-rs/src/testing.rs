//! Testing utilities for routers and resumable sources.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! controlflow = { path = "../controlflow-rs", features = ["testing"] }
//! ```
//!
//! # Scripted Upstreams
//!
//! ```ignore
//! use controlflow::testing::{ScriptedResume, Step};
//!
//! let upstream = ScriptedResume::new()
//!     .run(vec![Step::Emit(1), Step::Emit(2), Step::Fail("reset".into())])
//!     .run(vec![Step::Emit(3)]);
//!
//! let source = ResumableSource::builder(0)
//!     .policy(policy)
//!     .look_behind(2)
//!     .resume(upstream.resume_fn())
//!     .next_seed(|last: Vec<i32>| last.last().copied().unwrap_or(0))
//!     .build()?;
//!
//! // later
//! assert_eq!(upstream.seeds(), vec![0, 2]);
//! ```
//!
//! # Recording Destinations
//!
//! ```ignore
//! use controlflow::testing::RecordingDestination;
//!
//! let search = RecordingDestination::new();
//! let pipeline = RoutingPipeline::builder()
//!     .stage(Stage::new("search", search.clone()).tag(Kind::Search))
//!     .build();
//!
//! pipeline.route(envelope);
//! assert_eq!(search.len(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::Instant;

use crate::destination::Destination;
use crate::envelope::Envelope;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Poisoned by a panicking test thread; the data is still usable
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Recording Destination
// =============================================================================

/// Destination that keeps every envelope it is told, in arrival order.
///
/// Clones share the same record.
pub struct RecordingDestination<M, R> {
    received: Arc<Mutex<Vec<Envelope<M, R>>>>,
}

impl<M, R> RecordingDestination<M, R> {
    pub fn new() -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of envelopes received so far.
    pub fn len(&self) -> usize {
        lock(&self.received).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything received so far.
    pub fn take(&self) -> Vec<Envelope<M, R>> {
        std::mem::take(&mut *lock(&self.received))
    }
}

impl<M: Clone, R: Clone> RecordingDestination<M, R> {
    /// Copy of everything received so far.
    pub fn received(&self) -> Vec<Envelope<M, R>> {
        lock(&self.received).clone()
    }
}

impl<M, R> Clone for RecordingDestination<M, R> {
    fn clone(&self) -> Self {
        Self {
            received: self.received.clone(),
        }
    }
}

impl<M, R> Default for RecordingDestination<M, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, R> Destination<M, R> for RecordingDestination<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    fn tell(&self, envelope: Envelope<M, R>) {
        lock(&self.received).push(envelope);
    }
}

// =============================================================================
// Scripted Resume
// =============================================================================

/// One step of a scripted sub-stream.
#[derive(Debug, Clone)]
pub enum Step<E> {
    /// Emit an element.
    Emit(E),
    /// Wait before the next step.
    Sleep(Duration),
    /// Fail the sub-stream with this message.
    Fail(String),
    /// Never make progress again.
    Hang,
}

struct ScriptState<S, E> {
    runs: VecDeque<Vec<Step<E>>>,
    seeds: Vec<(S, Instant)>,
}

/// A fake upstream that replays one scripted run per resumption.
///
/// A run whose steps are used up completes cleanly. Once every run is used,
/// further resumptions hang. Every seed passed in is recorded with the
/// instant of the call.
pub struct ScriptedResume<S, E> {
    state: Arc<Mutex<ScriptState<S, E>>>,
}

impl<S, E> ScriptedResume<S, E>
where
    S: Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                runs: VecDeque::new(),
                seeds: Vec::new(),
            })),
        }
    }

    /// Append a scripted run.
    pub fn run(self, steps: Vec<Step<E>>) -> Self {
        lock(&self.state).runs.push_back(steps);
        self
    }

    /// Resumption function to hand to a source builder.
    pub fn resume_fn(&self) -> impl FnMut(S) -> BoxStream<'static, anyhow::Result<E>> + Send + 'static {
        let state = self.state.clone();
        move |seed| {
            let steps = {
                let mut state = lock(&state);
                state.seeds.push((seed, Instant::now()));
                state.runs.pop_front()
            };
            match steps {
                Some(steps) => play(steps),
                None => stream::pending().boxed(),
            }
        }
    }

    /// How many times the resumption function was called.
    pub fn calls(&self) -> usize {
        lock(&self.state).seeds.len()
    }

    /// Instants at which the resumption function was called.
    pub fn call_times(&self) -> Vec<Instant> {
        lock(&self.state).seeds.iter().map(|(_, at)| *at).collect()
    }
}

impl<S: Clone, E> ScriptedResume<S, E> {
    /// Seeds passed to the resumption function, in call order.
    pub fn seeds(&self) -> Vec<S> {
        lock(&self.state).seeds.iter().map(|(s, _)| s.clone()).collect()
    }
}

impl<S, E> Clone for ScriptedResume<S, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<S, E> Default for ScriptedResume<S, E>
where
    S: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn play<E: Send + 'static>(steps: Vec<Step<E>>) -> BoxStream<'static, anyhow::Result<E>> {
    stream::unfold(VecDeque::from(steps), |mut steps| async move {
        loop {
            match steps.pop_front()? {
                Step::Emit(element) => return Some((Ok(element), steps)),
                Step::Sleep(duration) => tokio::time::sleep(duration).await,
                Step::Fail(message) => {
                    steps.clear();
                    return Some((Err(anyhow!(message)), steps));
                }
                Step::Hang => futures::future::pending::<()>().await,
            }
        }
    })
    .boxed()
}
