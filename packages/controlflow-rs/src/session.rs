//! Arrival-order routing loop.
//!
//! A [`RouterSession`] owns a [`RoutingPipeline`] inside a tokio task and feeds
//! it envelopes from an mpsc inbox, one at a time, in the order they arrived.
//! The returned [`SessionHandle`] is itself a [`Destination`], so a session can
//! be registered in a [`Directory`](crate::Directory) and addressed by path.
//!
//! ```text
//! SessionHandle ─┐
//! SessionHandle ─┼─► inbox (bounded mpsc) ─► route() ─► stage destinations
//! SessionHandle ─┘
//! ```
//!
//! The task ends once every handle is dropped and the inbox is drained.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::destination::Destination;
use crate::envelope::{Envelope, Routable};
use crate::error::FlowError;
use crate::router::{Routed, RoutingPipeline};

/// Counts reported when a session loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub forwarded: u64,
    pub unmatched: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
}

impl SessionStats {
    fn record(&mut self, routed: Routed) {
        match routed {
            Routed::Forwarded { .. } => self.forwarded += 1,
            Routed::Unmatched => self.unmatched += 1,
            Routed::DeadLettered => self.dead_lettered += 1,
            Routed::Dropped { .. } => self.dropped += 1,
        }
    }

    /// Envelopes taken from the inbox.
    pub fn total(&self) -> u64 {
        self.forwarded + self.unmatched + self.dead_lettered + self.dropped
    }
}

/// Spawns routing loops.
pub struct RouterSession;

impl RouterSession {
    /// Spawn a task routing everything sent to the returned handle.
    ///
    /// `capacity` bounds the inbox; a full inbox drops new envelopes told
    /// through [`Destination::tell`] with a warning instead of blocking.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidConfig`] if `capacity` is zero.
    pub fn spawn<M, R>(
        pipeline: RoutingPipeline<M, R>,
        capacity: usize,
    ) -> Result<(SessionHandle<M, R>, JoinHandle<SessionStats>), FlowError>
    where
        M: Routable + Send + 'static,
        R: Send + 'static,
    {
        Self::spawn_shared(Arc::new(pipeline), capacity)
    }

    /// Like [`spawn`](Self::spawn), for a pipeline shared with other sessions.
    pub fn spawn_shared<M, R>(
        pipeline: Arc<RoutingPipeline<M, R>>,
        capacity: usize,
    ) -> Result<(SessionHandle<M, R>, JoinHandle<SessionStats>), FlowError>
    where
        M: Routable + Send + 'static,
        R: Send + 'static,
    {
        if capacity == 0 {
            return Err(FlowError::invalid("capacity", "inbox capacity must be positive"));
        }

        let (tx, mut rx) = mpsc::channel::<Envelope<M, R>>(capacity);
        let name = pipeline.name().to_string();

        let task = tokio::spawn(async move {
            let mut stats = SessionStats::default();
            debug!(router = %pipeline.name(), capacity, "router session started");

            while let Some(envelope) = rx.recv().await {
                stats.record(pipeline.route(envelope));
            }

            info!(
                router = %pipeline.name(),
                forwarded = stats.forwarded,
                unmatched = stats.unmatched,
                dead_lettered = stats.dead_lettered,
                dropped = stats.dropped,
                "router session stopped"
            );
            stats
        });

        Ok((SessionHandle { name, inbox: tx }, task))
    }
}

/// Sending side of a [`RouterSession`]. Cheap to clone.
pub struct SessionHandle<M, R> {
    name: String,
    inbox: mpsc::Sender<Envelope<M, R>>,
}

impl<M, R> SessionHandle<M, R> {
    /// Name of the pipeline behind this session.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once the session task has stopped.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

impl<M, R> SessionHandle<M, R>
where
    M: Send,
    R: Send,
{
    /// Enqueue `envelope`, waiting for inbox space.
    ///
    /// Returns the envelope back if the session has stopped.
    pub async fn send(&self, envelope: Envelope<M, R>) -> Result<(), Envelope<M, R>> {
        self.inbox.send(envelope).await.map_err(|e| e.0)
    }
}

impl<M, R> Clone for SessionHandle<M, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inbox: self.inbox.clone(),
        }
    }
}

impl<M, R> fmt::Debug for SessionHandle<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("name", &self.name)
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

impl<M, R> Destination<M, R> for SessionHandle<M, R>
where
    M: Send,
    R: Send,
{
    fn tell(&self, envelope: Envelope<M, R>) {
        self.inbox.tell(envelope);
    }
}
