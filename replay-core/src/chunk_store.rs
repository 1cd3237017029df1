//! Content-addressed store of immutable trajectory chunks.
//!
//! The store only keeps weak slots: a chunk lives as long as some insert
//! stream cache, table item or in-flight sample message holds its handle.
//! Dropping the last handle removes the chunk's slot. Inserting a key whose chunk is still alive returns the existing handle, so
//! concurrent producers sending the same chunk share one allocation.

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use replay_proto::ChunkData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{ReplayError, Result};

/// Opaque content address of a chunk.
pub type ChunkKey = u64;

type Slots = DashMap<ChunkKey, Weak<Chunk>>;

/// Immutable chunk shared between the store and every item referencing it.
#[derive(Debug)]
pub struct Chunk {
    data: ChunkData,
    slots: Weak<Slots>,
}

impl Chunk {
    #[must_use]
    pub const fn key(&self) -> ChunkKey {
        self.data.chunk_key
    }

    /// Wire representation of the chunk.
    #[must_use]
    pub const fn data(&self) -> &ChunkData {
        &self.data
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.data.data
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // The slot may already hold a newer chunk inserted under the same key.
        if let Some(slots) = self.slots.upgrade() {
            slots.remove_if(&self.key(), |_, slot| slot.strong_count() == 0);
        }
    }
}

/// Reference-counted, deduplicating chunk store.
#[derive(Debug, Default)]
pub struct ChunkStore {
    chunks: Arc<Slots>,
    closed: AtomicBool,
}

impl ChunkStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a chunk, or return the live chunk already stored under its key.
    ///
    /// Returns `None` once the store has been closed.
    pub fn insert(&self, data: ChunkData) -> Option<Arc<Chunk>> {
        if self.is_closed() {
            return None;
        }

        let slots = Arc::downgrade(&self.chunks);
        match self.chunks.entry(data.chunk_key) {
            Entry::Occupied(mut slot) => {
                if let Some(existing) = slot.get().upgrade() {
                    return Some(existing);
                }
                let chunk = Arc::new(Chunk { data, slots });
                slot.insert(Arc::downgrade(&chunk));
                Some(chunk)
            }
            Entry::Vacant(slot) => {
                let chunk = Arc::new(Chunk { data, slots });
                slot.insert(Arc::downgrade(&chunk));
                Some(chunk)
            }
        }
    }

    /// Resolve live chunks for `keys`, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::NotFound`] if any key has no live chunk.
    pub fn get(&self, keys: &[ChunkKey]) -> Result<Vec<Arc<Chunk>>> {
        keys.iter()
            .map(|key| {
                self.chunks
                    .get(key)
                    .and_then(|slot| slot.upgrade())
                    .ok_or_else(|| ReplayError::NotFound(format!("Chunk {key} cannot be found.")))
            })
            .collect()
    }

    /// Number of chunks currently alive.
    #[must_use]
    pub fn live_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|slot| slot.value().strong_count() > 0)
            .count()
    }

    /// Number of slots in the index, live or not yet reclaimed.
    #[must_use]
    pub fn slots(&self) -> usize {
        self.chunks.len()
    }

    /// Stop accepting inserts. Existing handles stay valid.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(live_chunks = self.live_chunks(), "chunk store closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn chunk(key: ChunkKey, payload: &'static [u8]) -> ChunkData {
        ChunkData::new(key, Bytes::from_static(payload))
    }

    #[test]
    fn test_insert_deduplicates_live_chunks() {
        let store = ChunkStore::new();
        let first = store.insert(chunk(1, b"abc")).unwrap();
        let second = store.insert(chunk(1, b"ignored")).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.payload().as_ref(), b"abc");
        assert_eq!(store.live_chunks(), 1);
    }

    #[test]
    fn test_chunk_released_with_last_holder() {
        let store = ChunkStore::new();
        let handle = store.insert(chunk(7, b"xyz")).unwrap();
        assert_eq!(store.get(&[7]).unwrap()[0].key(), 7);

        drop(handle);
        assert!(matches!(store.get(&[7]), Err(ReplayError::NotFound(_))));
        assert_eq!(store.slots(), 0);

        let replacement = store.insert(chunk(7, b"new")).unwrap();
        assert_eq!(replacement.payload().as_ref(), b"new");
    }

    #[test]
    fn test_released_chunks_leave_no_slots() {
        let store = ChunkStore::new();
        for key in 0..1_000 {
            let handle = store.insert(ChunkData::new(key, vec![0_u8; 4])).unwrap();
            drop(handle);
        }
        assert_eq!(store.slots(), 0);

        let kept: Vec<_> = (0..10)
            .map(|key| store.insert(ChunkData::new(key, vec![1_u8])).unwrap())
            .collect();
        let shared = store.insert(ChunkData::new(3, vec![2_u8])).unwrap();
        assert_eq!(store.slots(), 10);

        drop(kept);
        assert_eq!(store.slots(), 1);
        drop(shared);
        assert_eq!(store.slots(), 0);
    }

    #[test]
    fn test_store_outlived_by_chunk() {
        let store = ChunkStore::new();
        let handle = store.insert(chunk(5, b"late")).unwrap();
        drop(store);

        assert_eq!(handle.payload().as_ref(), b"late");
    }

    #[test]
    fn test_closed_store_rejects_inserts() {
        let store = ChunkStore::new();
        let kept = store.insert(chunk(1, b"a")).unwrap();
        store.close();
        store.close();

        assert!(store.is_closed());
        assert!(store.insert(chunk(2, b"b")).is_none());
        assert_eq!(kept.payload().as_ref(), b"a");
    }
}
