//! Resumable source: a stream that survives failures of its upstream.
//!
//! A [`ResumableSource`] repeatedly calls a caller-supplied resumption
//! function `S -> stream of E`. When the current sub-stream fails, the source
//! snapshots the last `N` emitted elements, waits out an exponential backoff,
//! asks the caller for a new seed computed from that snapshot, and resumes.
//!
//! ```text
//! seed ──► resume(seed) ──► elements ────────────────────────────► consumer
//!   ▲                          │                  (copied into look-behind)
//!   │                          │ error
//!   │                          ▼
//!   └── next_seed(snapshot) ◄── backoff delay ◄── restart budget check
//!                                                   │ exhausted
//!                                                   ▼
//!                                         RestartBudgetExhausted ──► consumer
//! ```
//!
//! # State Machine
//!
//! ```text
//! Seeded ─► Streaming ─┬─ sub-stream completes ─► Completed
//!   ▲                  └─ sub-stream fails ─► Recovering ─┬─ timer fires ─► Seeded
//!   │                                                    │
//!   └────────────────────────────────────────────────────┘
//!                         budget exhausted ─► Failed
//! any non-terminal state ─ cancel()/drop ─► Cancelled
//! ```
//!
//! # Guarantees
//!
//! - **Pull-based**: an element is requested from the sub-stream only when the
//!   consumer polls, so the source never buffers ahead of its consumer
//! - **One sub-stream at a time**: the next `resume` call happens only after
//!   the previous sub-stream has terminated and been dropped
//! - **Never auto-resumes a clean completion**: a sub-stream that ends without
//!   error completes the whole source
//! - **Non-blocking delay**: the backoff is a `tokio` timer polled by the stream
//! - **Single use**: once terminal, the source stays terminal
//!
//! # Example
//!
//! ```ignore
//! use controlflow::{BackoffPolicy, RestartBudget, ResumableSource};
//! use futures::StreamExt;
//!
//! let policy = BackoffPolicy::new(
//!     Duration::from_millis(100),
//!     Duration::from_secs(1),
//!     RestartBudget::Limited(5),
//!     Duration::from_secs(10),
//! )?;
//!
//! let mut source = ResumableSource::builder(0u64)
//!     .name("things-journal")
//!     .policy(policy)
//!     .look_behind(1)
//!     .resume(move |offset| journal.read_from(offset))
//!     .next_seed(|last: Vec<Entry>| last.last().map_or(0, |e| e.seq + 1))
//!     .build()?;
//!
//! while let Some(entry) = source.next().await {
//!     let entry = entry?; // only RestartBudgetExhausted gets here
//!     apply(entry);
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, FusedStream, Stream, StreamExt};
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, warn};

use crate::backoff::{BackoffDecision, BackoffPolicy, BackoffScheduler};
use crate::config::ResumeSettings;
use crate::error::FlowError;
use crate::look_behind::LookBehindBuffer;

type ResumeFn<S, E> = Box<dyn FnMut(S) -> BoxStream<'static, anyhow::Result<E>> + Send>;
type NextSeedFn<S, E> = Box<dyn FnMut(FailureRecord<E>) -> S + Send>;

const DEFAULT_NAME: &str = "resumable-source";

// =============================================================================
// Failure Record
// =============================================================================

/// What the source knows about one sub-stream failure.
///
/// Built once per failure and consumed by the seed recomputation.
#[derive(Debug)]
pub struct FailureRecord<E> {
    /// The last emitted elements, oldest first.
    pub look_behind: Vec<E>,
    /// The error that ended the sub-stream.
    pub cause: anyhow::Error,
    /// Wall-clock time of the failure.
    pub failed_at: DateTime<Utc>,
}

// =============================================================================
// Phase
// =============================================================================

/// Observable state of a [`ResumableSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Holding a seed; the next poll calls the resumption function.
    Seeded,
    /// Consuming the current sub-stream.
    Streaming,
    /// Waiting out the backoff delay after a failure.
    Recovering,
    /// A sub-stream completed cleanly. Terminal.
    Completed,
    /// The restart budget was exhausted. Terminal.
    Failed,
    /// The consumer cancelled. Terminal.
    Cancelled,
}

impl Phase {
    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Seeded => write!(f, "seeded"),
            Phase::Streaming => write!(f, "streaming"),
            Phase::Recovering => write!(f, "recovering"),
            Phase::Completed => write!(f, "completed"),
            Phase::Failed => write!(f, "failed"),
            Phase::Cancelled => write!(f, "cancelled"),
        }
    }
}

enum State<S, E> {
    Seeded(S),
    Streaming(BoxStream<'static, anyhow::Result<E>>),
    Recovering {
        timer: Pin<Box<Sleep>>,
        record: FailureRecord<E>,
    },
    Completed,
    Failed,
    Cancelled,
}

impl<S, E> State<S, E> {
    fn phase(&self) -> Phase {
        match self {
            State::Seeded(_) => Phase::Seeded,
            State::Streaming(_) => Phase::Streaming,
            State::Recovering { .. } => Phase::Recovering,
            State::Completed => Phase::Completed,
            State::Failed => Phase::Failed,
            State::Cancelled => Phase::Cancelled,
        }
    }
}

// =============================================================================
// Resumable Source
// =============================================================================

/// A lazy, single-subscriber stream that resumes its upstream after failures.
///
/// Yields `Ok(element)` for every element of every sub-stream, and at most one
/// `Err(FlowError::RestartBudgetExhausted)` right before ending.
///
/// Build one with [`ResumableSource::builder`].
pub struct ResumableSource<S, E> {
    name: String,
    state: State<S, E>,
    resume: ResumeFn<S, E>,
    next_seed: NextSeedFn<S, E>,
    look_behind: LookBehindBuffer<E>,
    scheduler: BackoffScheduler,
    /// Sub-streams started so far.
    attempts: u64,
    /// Elements emitted so far, across sub-streams.
    emitted: u64,
}

// No field is ever pin-projected; sub-streams and timers are boxed.
impl<S, E> Unpin for ResumableSource<S, E> {}

impl<S, E> ResumableSource<S, E>
where
    S: Send + 'static,
    E: Clone + Send + 'static,
{
    /// Start building a source that will first resume from `initial_seed`.
    pub fn builder(initial_seed: S) -> ResumableSourceBuilder<S, E> {
        ResumableSourceBuilder::new(initial_seed)
    }
}

impl<S, E> ResumableSource<S, E> {
    /// Name used in log fields.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state machine phase.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Lifetime count of sub-stream failures.
    pub fn restarts(&self) -> u32 {
        self.scheduler.restarts()
    }

    /// Number of sub-streams started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Number of elements emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Stop the source.
    ///
    /// Drops the active sub-stream and any pending backoff timer, discards the
    /// look-behind buffer, and guarantees the resumption function is not
    /// called again. Does nothing if the source is already terminal.
    pub fn cancel(&mut self) {
        if self.state.phase().is_terminal() {
            return;
        }
        debug!(
            source = %self.name,
            phase = %self.state.phase(),
            emitted = self.emitted,
            "resumable source cancelled"
        );
        self.state = State::Cancelled;
        self.look_behind.clear();
    }
}

impl<S, E> ResumableSource<S, E>
where
    E: Clone,
{
    /// Handle a sub-stream failure. Returns the terminal item if the budget is spent.
    fn on_failure(&mut self, cause: anyhow::Error) -> Option<Result<E, FlowError>> {
        let record = FailureRecord {
            look_behind: self.look_behind.snapshot(),
            cause,
            failed_at: Utc::now(),
        };

        match self.scheduler.on_failure(Instant::now()) {
            BackoffDecision::Exhausted { restarts } => {
                error!(
                    source = %self.name,
                    restarts,
                    budget = %self.scheduler.policy().restart_budget(),
                    failed_at = %record.failed_at,
                    error = %record.cause,
                    "restart budget exhausted; failing resumable source"
                );
                self.state = State::Failed;
                self.look_behind.clear();
                Some(Err(FlowError::RestartBudgetExhausted {
                    restarts,
                    source: record.cause,
                }))
            }
            BackoffDecision::Retry { delay } => {
                warn!(
                    source = %self.name,
                    restarts = self.scheduler.restarts(),
                    delay_ms = delay.as_millis() as u64,
                    look_behind = record.look_behind.len(),
                    failed_at = %record.failed_at,
                    error = %record.cause,
                    "sub-stream failed; resuming after backoff"
                );
                self.state = State::Recovering {
                    timer: Box::pin(tokio::time::sleep(delay)),
                    record,
                };
                None
            }
        }
    }
}

impl<S, E> Stream for ResumableSource<S, E>
where
    E: Clone,
{
    type Item = Result<E, FlowError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match mem::replace(&mut this.state, State::Cancelled) {
                State::Seeded(seed) => {
                    this.attempts += 1;
                    debug!(
                        source = %this.name,
                        attempt = this.attempts,
                        "starting sub-stream"
                    );
                    this.state = State::Streaming((this.resume)(seed));
                }
                State::Streaming(mut stream) => match stream.as_mut().poll_next(cx) {
                    Poll::Pending => {
                        this.state = State::Streaming(stream);
                        return Poll::Pending;
                    }
                    Poll::Ready(Some(Ok(element))) => {
                        this.state = State::Streaming(stream);
                        this.look_behind.push(element.clone());
                        this.emitted += 1;
                        return Poll::Ready(Some(Ok(element)));
                    }
                    Poll::Ready(Some(Err(cause))) => {
                        // Tear down the failed sub-stream before anything else
                        drop(stream);
                        if let Some(terminal) = this.on_failure(cause) {
                            return Poll::Ready(Some(terminal));
                        }
                    }
                    Poll::Ready(None) => {
                        debug!(
                            source = %this.name,
                            attempts = this.attempts,
                            emitted = this.emitted,
                            "sub-stream completed; resumable source complete"
                        );
                        this.state = State::Completed;
                        this.look_behind.clear();
                        return Poll::Ready(None);
                    }
                },
                State::Recovering { mut timer, record } => {
                    if timer.as_mut().poll(cx).is_pending() {
                        this.state = State::Recovering { timer, record };
                        return Poll::Pending;
                    }
                    let seed = (this.next_seed)(record);
                    this.state = State::Seeded(seed);
                }
                terminal @ (State::Completed | State::Failed | State::Cancelled) => {
                    this.state = terminal;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl<S, E> FusedStream for ResumableSource<S, E>
where
    E: Clone,
{
    fn is_terminated(&self) -> bool {
        self.state.phase().is_terminal()
    }
}

impl<S, E> Drop for ResumableSource<S, E> {
    fn drop(&mut self) {
        if !self.state.phase().is_terminal() {
            debug!(
                source = %self.name,
                phase = %self.state.phase(),
                "resumable source dropped before termination"
            );
        }
    }
}

impl<S, E> fmt::Debug for ResumableSource<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumableSource")
            .field("name", &self.name)
            .field("phase", &self.state.phase())
            .field("restarts", &self.scheduler.restarts())
            .field("attempts", &self.attempts)
            .field("emitted", &self.emitted)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`ResumableSource`].
///
/// `policy` (or `settings`), `look_behind`, `resume` and `next_seed` are
/// required. Every problem is reported by [`build`](Self::build), before any
/// resumption happens.
pub struct ResumableSourceBuilder<S, E> {
    name: String,
    initial_seed: S,
    policy: Option<BackoffPolicy>,
    look_behind: Option<usize>,
    resume: Option<ResumeFn<S, E>>,
    next_seed: Option<NextSeedFn<S, E>>,
    policy_error: Option<FlowError>,
    look_behind_error: Option<FlowError>,
}

impl<S, E> ResumableSourceBuilder<S, E>
where
    S: Send + 'static,
    E: Clone + Send + 'static,
{
    fn new(initial_seed: S) -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            initial_seed,
            policy: None,
            look_behind: None,
            resume: None,
            next_seed: None,
            policy_error: None,
            look_behind_error: None,
        }
    }

    /// Name used in log fields.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Backoff parameters and restart budget.
    pub fn policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = Some(policy);
        self.policy_error = None;
        self
    }

    /// How many emitted elements to remember for seed recomputation.
    pub fn look_behind(mut self, n: usize) -> Self {
        self.look_behind = Some(n);
        self.look_behind_error = None;
        self
    }

    /// Take policy and look-behind from unvalidated settings.
    ///
    /// Validation errors surface from [`build`](Self::build), unless a later
    /// [`policy`](Self::policy) or [`look_behind`](Self::look_behind) call
    /// replaces the rejected field.
    pub fn settings(mut self, settings: &ResumeSettings) -> Self {
        match settings.policy() {
            Ok(policy) => self = self.policy(policy),
            Err(e) => {
                self.policy = None;
                self.policy_error = Some(e);
            }
        }
        match settings.look_behind() {
            Ok(n) => self = self.look_behind(n),
            Err(e) => {
                self.look_behind = None;
                self.look_behind_error = Some(e);
            }
        }
        self
    }

    /// Function opening a sub-stream from a seed.
    ///
    /// The returned stream may fail at any point; failures are recovered
    /// from until the restart budget runs out.
    pub fn resume<F, St>(mut self, mut resume: F) -> Self
    where
        F: FnMut(S) -> St + Send + 'static,
        St: Stream<Item = anyhow::Result<E>> + Send + 'static,
    {
        self.resume = Some(Box::new(move |seed| resume(seed).boxed()));
        self
    }

    /// Function computing the next seed from the look-behind snapshot.
    pub fn next_seed<F>(mut self, mut next_seed: F) -> Self
    where
        F: FnMut(Vec<E>) -> S + Send + 'static,
    {
        self.next_seed = Some(Box::new(move |record: FailureRecord<E>| {
            next_seed(record.look_behind)
        }));
        self
    }

    /// Like [`next_seed`](Self::next_seed), but also sees the failure cause.
    pub fn next_seed_from_failure<F>(mut self, next_seed: F) -> Self
    where
        F: FnMut(FailureRecord<E>) -> S + Send + 'static,
    {
        self.next_seed = Some(Box::new(next_seed));
        self
    }

    /// Validate and build the source.
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidConfig`] for rejected settings or a missing
    /// required parameter.
    pub fn build(self) -> Result<ResumableSource<S, E>, FlowError> {
        if let Some(error) = self.policy_error.or(self.look_behind_error) {
            return Err(error);
        }
        let policy = self
            .policy
            .ok_or_else(|| FlowError::invalid("policy", "a backoff policy is required"))?;
        let look_behind = self
            .look_behind
            .ok_or_else(|| FlowError::invalid("look_behind", "a look-behind size is required"))?;
        let resume = self
            .resume
            .ok_or_else(|| FlowError::invalid("resume", "a resumption function is required"))?;
        let next_seed = self.next_seed.ok_or_else(|| {
            FlowError::invalid("next_seed", "a seed recomputation function is required")
        })?;

        debug!(
            source = %self.name,
            min_backoff_ms = policy.min_backoff().as_millis() as u64,
            max_backoff_ms = policy.max_backoff().as_millis() as u64,
            budget = %policy.restart_budget(),
            look_behind,
            "resumable source built"
        );

        Ok(ResumableSource {
            name: self.name,
            state: State::Seeded(self.initial_seed),
            resume,
            next_seed,
            look_behind: LookBehindBuffer::new(look_behind),
            scheduler: BackoffScheduler::new(policy),
            attempts: 0,
            emitted: 0,
        })
    }
}
