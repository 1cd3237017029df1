//! Checkpoint persistence contract.
//!
//! The on-disk format belongs to the implementation; the service only decides
//! when to save and which checkpoint to restore at startup.

use std::fmt;
use std::sync::Arc;

use crate::chunk_store::ChunkStore;
use crate::error::Result;
use crate::table::Table;

/// Saves and restores the full set of tables together with their chunks.
pub trait Checkpointer: fmt::Display + Send + Sync {
    /// Persist `tables` and return the path of the new checkpoint. At most
    /// `keep_latest` checkpoints are retained.
    ///
    /// # Errors
    ///
    /// Any persistence failure.
    fn save(&self, tables: &[Arc<dyn Table>], keep_latest: usize) -> Result<String>;

    /// Restore the most recent checkpoint of the configured root, inserting
    /// its chunks into `chunk_store`.
    ///
    /// # Errors
    ///
    /// [`ReplayError::NotFound`](crate::ReplayError::NotFound) when no
    /// checkpoint exists; anything else is a real failure.
    fn load_latest(&self, chunk_store: &ChunkStore) -> Result<Vec<Arc<dyn Table>>>;

    /// Restore the fallback checkpoint, if one is configured.
    ///
    /// # Errors
    ///
    /// [`ReplayError::NotFound`](crate::ReplayError::NotFound) when no
    /// fallback is configured or it does not exist.
    fn load_fallback_checkpoint(&self, chunk_store: &ChunkStore) -> Result<Vec<Arc<dyn Table>>>;
}
