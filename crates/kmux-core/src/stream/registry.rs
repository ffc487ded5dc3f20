//! Registry of live streams on one connection.
//!
//! Ids must arrive in strictly increasing order: once an id has been seen,
//! it and every lower id are rejected, even after the stream is removed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::StreamId;

struct RegistryInner<S> {
    streams: HashMap<StreamId, S>,
    highest: Option<StreamId>,
}

/// Live streams keyed by id.
///
/// Type parameter `S` is the stored handle (normally `Arc<StreamHandle>`).
/// The accept loop and stream workers touch the map concurrently, so every
/// operation runs under a single mutex.
pub struct StreamRegistry<S> {
    inner: Mutex<RegistryInner<S>>,
}

impl<S: Clone> StreamRegistry<S> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                streams: HashMap::new(),
                highest: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a stream.
    ///
    /// Returns false, leaving the registry untouched, unless `id` is strictly
    /// greater than every id added before.
    pub fn add(&self, id: StreamId, stream: S) -> bool {
        let mut inner = self.lock();
        if inner.highest.is_some_and(|highest| id <= highest) {
            return false;
        }
        inner.highest = Some(id);
        inner.streams.insert(id, stream);
        true
    }

    /// Remove a stream by id.
    pub fn remove(&self, id: StreamId) -> Option<S> {
        self.lock().streams.remove(&id)
    }

    /// Get a clone of a stream handle by id.
    pub fn try_get(&self, id: StreamId) -> Option<S> {
        self.lock().streams.get(&id).cloned()
    }

    /// Check if a stream is registered.
    pub fn contains(&self, id: StreamId) -> bool {
        self.lock().streams.contains_key(&id)
    }

    /// Highest id ever added.
    pub fn highest_id(&self) -> Option<StreamId> {
        self.lock().highest
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.lock().streams.is_empty()
    }

    /// Snapshot of live streams, ordered by id.
    pub fn snapshot(&self) -> Vec<(StreamId, S)> {
        let mut streams: Vec<(StreamId, S)> = self
            .lock()
            .streams
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        streams.sort_unstable_by_key(|(id, _)| *id);
        streams
    }

    /// Run `f` for every live stream.
    ///
    /// Iterates a snapshot taken under the lock, so `f` may add or remove
    /// streams (including the one it is visiting).
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(StreamId, &S),
    {
        for (id, stream) in self.snapshot() {
            f(id, &stream);
        }
    }

    /// Remove every stream, returning them.
    ///
    /// The highest-id watermark is kept.
    pub fn clear(&self) -> Vec<(StreamId, S)> {
        let mut drained: Vec<(StreamId, S)> = self.lock().streams.drain().collect();
        drained.sort_unstable_by_key(|(id, _)| *id);
        drained
    }
}

impl<S> fmt::Debug for StreamRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("StreamRegistry")
            .field("len", &inner.streams.len())
            .field("highest", &inner.highest)
            .finish()
    }
}

impl<S: Clone> Default for StreamRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
