//! Inbound signals and their routing tags.
//!
//! Signals arrive as JSON objects tagged by `type`:
//!
//! ```json
//! {"type": "ThingSearch", "filter": "eq(attributes/color,\"red\")", "namespaces": ["org.acme"]}
//! {"type": "SudoRetrieveThings", "thing_ids": ["org.acme:lamp-1"]}
//! ```

use controlflow::{Envelope, Routable};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A command the dispatcher knows how to route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Signal {
    /// Search on behalf of an authenticated user.
    ThingSearch {
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        namespaces: Vec<String>,
    },
    /// Search bypassing authorization.
    SudoThingSearch {
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        namespaces: Vec<String>,
    },
    /// Fetch several things on behalf of an authenticated user.
    RetrieveThings { thing_ids: Vec<String> },
    /// Fetch several things bypassing authorization.
    SudoRetrieveThings { thing_ids: Vec<String> },
    /// Anything else; the dispatcher does not handle it.
    Other {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

/// Routing tag of a [`Signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SignalKind {
    ThingSearch,
    SudoThingSearch,
    RetrieveThings,
    SudoRetrieveThings,
    Other,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::ThingSearch { .. } => SignalKind::ThingSearch,
            Signal::SudoThingSearch { .. } => SignalKind::SudoThingSearch,
            Signal::RetrieveThings { .. } => SignalKind::RetrieveThings,
            Signal::SudoRetrieveThings { .. } => SignalKind::SudoRetrieveThings,
            Signal::Other { .. } => SignalKind::Other,
        }
    }

    /// Returns true for the authorization-bypassing variants.
    pub fn is_sudo(&self) -> bool {
        matches!(
            self,
            Signal::SudoThingSearch { .. } | Signal::SudoRetrieveThings { .. }
        )
    }
}

impl Routable for Signal {
    type Tag = SignalKind;

    fn tag(&self) -> SignalKind {
        self.kind()
    }
}

/// Answer sent back to whoever issued a signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Reply {
    /// A search was accepted by the search worker.
    SearchAccepted {
        cid: String,
        filter: Option<String>,
        namespaces: Vec<String>,
        sudo: bool,
    },
    /// Things gathered by the aggregator, in request order.
    Things {
        cid: String,
        thing_ids: Vec<String>,
        sudo: bool,
    },
}

/// Channel replies travel on.
pub type ReplyTo = mpsc::UnboundedSender<Reply>;

/// A signal in flight through the dispatcher.
pub type SignalEnvelope = Envelope<Signal, ReplyTo>;
