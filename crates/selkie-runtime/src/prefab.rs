//! Worker-local prefab cache
//!
//! Interns payload buffers so a sender can fan a large payload out to many
//! receivers on its own worker without copying it once per message. The
//! cache is the only place a `Buffer` is shared outside a message, and it
//! never crosses a worker boundary, which keeps buffer ownership exclusive
//! everywhere else.
//!
//! Purging is mark-and-sweep over two sweeps: an entry only the cache still
//! references is marked stale on the first sweep and dropped on the next,
//! so a freshly interned prefab survives until it has had a chance to be
//! sent.

use selkie_core::Buffer;
use std::collections::HashMap;
use std::sync::Arc;

struct PrefabEntry {
    buffer: Arc<Buffer>,
    stale: bool,
}

#[derive(Default)]
pub(crate) struct PrefabCache {
    entries: HashMap<u64, PrefabEntry>,
    next_id: u64,
}

impl PrefabCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Intern a buffer; returns its non-zero local id
    pub(crate) fn intern(&mut self, buffer: Buffer) -> u64 {
        self.next_id += 1;
        debug_assert!(self.next_id != 0);
        self.entries.insert(
            self.next_id,
            PrefabEntry {
                buffer: Arc::new(buffer),
                stale: false,
            },
        );
        self.next_id
    }

    /// Shared handle to an interned buffer
    pub(crate) fn get(&mut self, id: u64) -> Option<Arc<Buffer>> {
        let entry = self.entries.get_mut(&id)?;
        entry.stale = false;
        Some(entry.buffer.clone())
    }

    /// Drop entries that have been referenced by nobody else for two sweeps
    pub(crate) fn sweep(&mut self) {
        self.entries.retain(|_, entry| {
            if Arc::strong_count(&entry.buffer) > 1 {
                entry.stale = false;
                return true;
            }
            if entry.stale {
                return false;
            }
            entry.stale = true;
            true
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_and_get_share_memory() {
        let mut cache = PrefabCache::new();
        let id = cache.intern(Buffer::from("broadcast payload"));
        assert!(id != 0);
        let a = cache.get(id).unwrap();
        let b = cache.get(id).unwrap();
        assert_eq!(a.data().as_ptr(), b.data().as_ptr());
    }

    #[test]
    fn test_unknown_id() {
        let mut cache = PrefabCache::new();
        assert!(cache.get(42).is_none());
    }

    #[test]
    fn test_sweep_requires_two_idle_passes() {
        let mut cache = PrefabCache::new();
        let id = cache.intern(Buffer::from("x"));
        cache.sweep();
        assert_eq!(cache.len(), 1); // marked, not yet dropped
        cache.sweep();
        assert_eq!(cache.len(), 0);
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn test_sweep_spares_referenced_entries() {
        let mut cache = PrefabCache::new();
        let id = cache.intern(Buffer::from("kept"));
        let held = cache.get(id).unwrap();
        cache.sweep();
        cache.sweep();
        assert_eq!(cache.len(), 1);
        drop(held);
        cache.sweep();
        cache.sweep();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_get_unmarks_stale_entry() {
        let mut cache = PrefabCache::new();
        let id = cache.intern(Buffer::from("poked"));
        cache.sweep();
        let handle = cache.get(id).unwrap();
        drop(handle);
        cache.sweep();
        assert_eq!(cache.len(), 1); // the get reset the mark
    }
}
