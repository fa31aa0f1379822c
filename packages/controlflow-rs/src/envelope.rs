//! Messages in flight: payload, reply channel and correlation.
//!
//! An [`Envelope`] is what travels through a
//! [`RoutingPipeline`](crate::RoutingPipeline). Routing never touches the
//! reply channel, so whichever stage ends up handling the payload can answer
//! the original sender directly.
//!
//! # Example
//!
//! ```ignore
//! use controlflow::{Envelope, Routable};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Kind { Search, Retrieve }
//!
//! impl Routable for Query {
//!     type Tag = Kind;
//!     fn tag(&self) -> Kind { /* ... */ }
//! }
//!
//! let (reply_tx, reply_rx) = oneshot::channel();
//! let envelope = Envelope::new(query, reply_tx);
//! ```

use std::fmt;
use std::hash::Hash;

use uuid::Uuid;

// =============================================================================
// Correlation ID
// =============================================================================

/// Identifier tying an envelope to the request that produced it.
///
/// Use `CorrelationId::NONE` for uncorrelated messages, or
/// `CorrelationId::new()` to generate a fresh ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value for uncorrelated messages (nil UUID).
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check if this is the NONE sentinel value.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Routable
// =============================================================================

/// A payload that can be classified for routing.
///
/// The tag is a cheap discriminant; pipelines index stages by it.
pub trait Routable {
    /// Discriminant type, usually a field-less enum.
    type Tag: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Classify this payload.
    fn tag(&self) -> Self::Tag;
}

// =============================================================================
// Envelope
// =============================================================================

/// A payload plus the channel its eventual handler should reply on.
#[derive(Debug, Clone)]
pub struct Envelope<M, R> {
    pub payload: M,
    pub reply_to: R,
    pub cid: CorrelationId,
}

impl<M, R> Envelope<M, R> {
    /// Wrap `payload` with a fresh correlation ID.
    pub fn new(payload: M, reply_to: R) -> Self {
        Self {
            payload,
            reply_to,
            cid: CorrelationId::new(),
        }
    }

    /// Replace the correlation ID.
    pub fn with_cid(mut self, cid: CorrelationId) -> Self {
        self.cid = cid;
        self
    }

    /// Transform the payload, keeping reply channel and correlation.
    pub fn map<N>(self, f: impl FnOnce(M) -> N) -> Envelope<N, R> {
        Envelope {
            payload: f(self.payload),
            reply_to: self.reply_to,
            cid: self.cid,
        }
    }
}

impl<M: Routable, R> Envelope<M, R> {
    /// Tag of the payload.
    pub fn tag(&self) -> M::Tag {
        self.payload.tag()
    }
}
