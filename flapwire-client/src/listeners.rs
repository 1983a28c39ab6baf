//! Copy-on-write listener registries.
//!
//! Mutation swaps in a new snapshot under a short write lock; dispatch clones
//! the current snapshot and iterates it with no lock held, so a listener may
//! add or remove listeners (itself included) while being called.

use parking_lot::RwLock;
use std::sync::Arc;

/// An ordered set of shared listeners.
pub struct Registry<T: ?Sized> {
    inner: RwLock<Arc<Vec<Arc<T>>>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Appends a listener. Registering the same `Arc` twice is a no-op.
    pub fn add(&self, listener: Arc<T>) {
        let mut guard = self.inner.write();
        if guard.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
    }

    /// Removes a listener by identity. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<T>) -> bool {
        let mut guard = self.inner.write();
        let before = guard.len();
        let next: Vec<Arc<T>> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        let removed = next.len() != before;
        if removed {
            *guard = Arc::new(next);
        }
        removed
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.inner.write() = Arc::new(Vec::new());
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
