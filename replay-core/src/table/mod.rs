//! Priority table contract consumed by the insert and sample pipelines.
//!
//! Tables own their locking: every method must be safe to call concurrently
//! from any number of streams and is treated as atomic by callers.

pub mod memory;

pub use memory::{InMemoryTable, TableConfig};

use replay_proto::{KeyWithPriority, PrioritizedItem, TableInfo};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::chunk_store::Chunk;
use crate::error::Result;

/// Sentinel `flexible_batch_size` asking for the table's configured default.
pub const AUTO_SELECT_FLEXIBLE_BATCH_SIZE: i32 = -1;

/// Item committed to a table: wire metadata plus the chunk handles that keep
/// its trajectory alive.
#[derive(Debug, Clone)]
pub struct TableItem {
    pub item: PrioritizedItem,
    pub chunks: Vec<Arc<Chunk>>,
}

impl TableItem {
    #[must_use]
    pub const fn new(item: PrioritizedItem, chunks: Vec<Arc<Chunk>>) -> Self {
        Self { item, chunks }
    }

    #[must_use]
    pub const fn key(&self) -> u64 {
        self.item.key
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.item.table
    }
}

/// One sampled item together with the sampling-time metadata.
///
/// Produced fresh per sample and consumed once by the serializer.
#[derive(Debug, Clone)]
pub struct SampledItem {
    pub item: Arc<TableItem>,
    pub priority: f64,
    pub times_sampled: i32,
    pub probability: f64,
    pub table_size: i64,
    /// Whether the rate limiter had to block before this sample was drawn.
    pub rate_limited: bool,
}

/// Named priority-sampling structure with its own rate limiter.
pub trait Table: fmt::Display + Send + Sync {
    fn name(&self) -> &str;

    /// Insert a new item or replace the item stored under the same key.
    ///
    /// # Errors
    ///
    /// Validation failures (priority, target table) or a closed table.
    fn insert_or_assign(&self, item: TableItem) -> Result<()>;

    /// Update priorities of existing items and delete items by key. Unknown
    /// keys are ignored.
    ///
    /// # Errors
    ///
    /// Invalid priorities or a closed table.
    fn mutate_items(&self, updates: &[KeyWithPriority], delete_keys: &[u64]) -> Result<()>;

    /// Remove every item and reset sampling statistics.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    fn reset(&self) -> Result<()>;

    /// Draw between one and `max_batch_size` samples.
    ///
    /// Blocks inside the rate limiter until sampling is allowed, for at most
    /// `timeout` (`None` waits indefinitely). Once `cancel` fires the call
    /// must return without drawing anything, so a caller that gave up never
    /// consumes items.
    ///
    /// # Errors
    ///
    /// `DeadlineExceeded` when the timeout elapses, `Cancelled` when the
    /// table is closed or `cancel` fires while waiting.
    fn sample_flexible_batch(
        &self,
        max_batch_size: usize,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SampledItem>>;

    /// Batch size used when a request asks for
    /// [`AUTO_SELECT_FLEXIBLE_BATCH_SIZE`].
    fn default_flexible_batch_size(&self) -> usize;

    fn size(&self) -> usize;

    fn info(&self) -> TableInfo;

    /// Wake blocked samplers and refuse further work. Idempotent.
    fn close(&self);
}
