//! Fire-and-forget sinks for routed envelopes.
//!
//! A [`Destination`] accepts an envelope and returns immediately. Whatever
//! happens afterwards (queueing, delivery, failure) is the destination's own
//! business: routers never wait on it and never retry.
//!
//! | Implementation | Behavior when it can't accept |
//! |----------------|-------------------------------|
//! | `mpsc::UnboundedSender` | receiver gone: logged at debug, dropped |
//! | `mpsc::Sender` | full or closed: logged at warn, dropped |
//! | [`Consume`] | n/a, the closure runs inline |
//! | `Arc<D>` | delegates to `D` |

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::envelope::Envelope;

/// An opaque sink that takes ownership of envelopes.
pub trait Destination<M, R>: Send + Sync {
    /// Hand off `envelope`. Must not block.
    fn tell(&self, envelope: Envelope<M, R>);
}

impl<M, R, D> Destination<M, R> for Arc<D>
where
    D: Destination<M, R> + ?Sized,
{
    fn tell(&self, envelope: Envelope<M, R>) {
        (**self).tell(envelope)
    }
}

impl<M, R> Destination<M, R> for mpsc::UnboundedSender<Envelope<M, R>>
where
    M: Send,
    R: Send,
{
    fn tell(&self, envelope: Envelope<M, R>) {
        if let Err(mpsc::error::SendError(envelope)) = self.send(envelope) {
            debug!(cid = %envelope.cid, "destination closed, envelope dropped");
        }
    }
}

impl<M, R> Destination<M, R> for mpsc::Sender<Envelope<M, R>>
where
    M: Send,
    R: Send,
{
    fn tell(&self, envelope: Envelope<M, R>) {
        match self.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                warn!(cid = %envelope.cid, "destination full, envelope dropped");
            }
            Err(TrySendError::Closed(envelope)) => {
                warn!(cid = %envelope.cid, "destination closed, envelope dropped");
            }
        }
    }
}

/// Destination backed by a closure, run inline on the routing thread.
///
/// ```ignore
/// let audit = Consume::new(|env: Envelope<Signal, Reply>| {
///     info!(cid = %env.cid, "saw signal");
/// });
/// ```
pub struct Consume<F> {
    f: F,
}

impl<F> Consume<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<M, R, F> Destination<M, R> for Consume<F>
where
    F: Fn(Envelope<M, R>) + Send + Sync,
{
    fn tell(&self, envelope: Envelope<M, R>) {
        (self.f)(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_unbounded_sender_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tx.tell(Envelope::new("ping", 1u8));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.payload, "ping");
        assert_eq!(received.reply_to, 1);
    }

    #[test]
    fn test_closed_unbounded_sender_drops_silently() {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope<&str, ()>>();
        drop(rx);

        tx.tell(Envelope::new("lost", ()));
    }

    #[tokio::test]
    async fn test_full_bounded_sender_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);

        tx.tell(Envelope::new(1, ()));
        tx.tell(Envelope::new(2, ()));

        assert_eq!(rx.recv().await.unwrap().payload, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_consume_runs_inline() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let dest = Arc::new(Consume::new(move |_: Envelope<u32, ()>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        dest.tell(Envelope::new(1, ()));
        dest.tell(Envelope::new(2, ()));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
