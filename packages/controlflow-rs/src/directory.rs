//! Logical-path addressing for destinations.
//!
//! A [`Directory`] maps well-known paths (`/user/dispatcher`) to destination
//! handles. Senders only need `send(path, envelope)`; they never learn where
//! or what the handle behind a path is.
//!
//! ```ignore
//! let directory = Directory::new();
//! directory.register("/user/thingsSearchRoot/thingsSearch", search_worker)?;
//!
//! // resolved at every tell, so re-registration is picked up
//! let search = directory.destination("/user/thingsSearchRoot/thingsSearch");
//! let pipeline = RoutingPipeline::builder()
//!     .stage(Stage::new("search", search).tag(SignalKind::ThingSearch))
//!     .build()?;
//! ```

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::destination::Destination;
use crate::envelope::Envelope;
use crate::error::FlowError;

/// Concurrent registry from logical path to destination.
///
/// Clones share the same registry.
pub struct Directory<M, R> {
    entries: Arc<DashMap<String, Arc<dyn Destination<M, R>>>>,
}

impl<M, R> Directory<M, R> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Register `destination` under `path`.
    ///
    /// # Errors
    ///
    /// [`FlowError::DestinationAlreadyRegistered`] if `path` is taken.
    pub fn register(
        &self,
        path: impl Into<String>,
        destination: impl Destination<M, R> + 'static,
    ) -> Result<(), FlowError> {
        let path = path.into();
        match self.entries.entry(path) {
            Entry::Occupied(entry) => Err(FlowError::DestinationAlreadyRegistered {
                path: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                info!(path = %entry.key(), "destination registered");
                entry.insert(Arc::new(destination));
                Ok(())
            }
        }
    }

    /// Register `destination` under `path`, replacing any existing handle.
    ///
    /// Returns true if a handle was replaced.
    pub fn replace(
        &self,
        path: impl Into<String>,
        destination: impl Destination<M, R> + 'static,
    ) -> bool {
        let path = path.into();
        let replaced = self
            .entries
            .insert(path.clone(), Arc::new(destination))
            .is_some();
        debug!(path = %path, replaced, "destination replaced");
        replaced
    }

    /// Remove the handle at `path`. Returns true if there was one.
    pub fn unregister(&self, path: &str) -> bool {
        let removed = self.entries.remove(path).is_some();
        if removed {
            info!(path = %path, "destination unregistered");
        }
        removed
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered paths, in no particular order.
    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Deliver `envelope` to whatever is registered at `path`.
    ///
    /// Returns false, after logging a dead letter, if nothing is registered.
    pub fn send(&self, path: &str, envelope: Envelope<M, R>) -> bool {
        // Clone the handle out so no shard lock is held while telling
        let destination = self.entries.get(path).map(|entry| entry.value().clone());
        match destination {
            Some(destination) => {
                destination.tell(envelope);
                true
            }
            None => {
                warn!(path = %path, cid = %envelope.cid, "no destination at path, envelope dead-lettered");
                false
            }
        }
    }

    /// A destination that forwards to `path`, resolved at every tell.
    pub fn destination(&self, path: impl Into<String>) -> DirectoryDestination<M, R> {
        DirectoryDestination {
            directory: self.clone(),
            path: path.into(),
        }
    }
}

impl<M, R> Clone for Directory<M, R> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<M, R> Default for Directory<M, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, R> fmt::Debug for Directory<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("paths", &self.paths())
            .finish()
    }
}

/// Destination addressed by logical path through a [`Directory`].
pub struct DirectoryDestination<M, R> {
    directory: Directory<M, R>,
    path: String,
}

impl<M, R> DirectoryDestination<M, R> {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<M, R> Clone for DirectoryDestination<M, R> {
    fn clone(&self) -> Self {
        Self {
            directory: self.directory.clone(),
            path: self.path.clone(),
        }
    }
}

impl<M, R> Destination<M, R> for DirectoryDestination<M, R>
where
    M: Send,
    R: Send,
{
    fn tell(&self, envelope: Envelope<M, R>) {
        self.directory.send(&self.path, envelope);
    }
}
