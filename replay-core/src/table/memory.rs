//! Reference in-memory table with proportional sampling and a minimum-size
//! rate limiter.
//!
//! Items are kept in insertion order so that the oldest item is evicted once
//! `max_size` is exceeded. Sampling is proportional to priority (uniform when
//! every priority is zero) and draws with replacement.

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use replay_proto::{KeyWithPriority, RateLimiterInfo, TableInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{SampledItem, Table, TableItem};
use crate::error::{ReplayError, Result};

/// Longest a blocked sampler goes without checking its cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration of an [`InMemoryTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub name: String,
    pub max_size: usize,
    /// Items are removed after this many samples; `0` means unlimited.
    pub max_times_sampled: i32,
    /// Sampling blocks while the table holds fewer items than this.
    pub min_size_to_sample: usize,
    pub default_flexible_batch_size: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_size: 1_000_000,
            max_times_sampled: 0,
            min_size_to_sample: 1,
            default_flexible_batch_size: 64,
        }
    }
}

impl TableConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

struct Entry {
    item: Arc<TableItem>,
    priority: f64,
    times_sampled: i32,
}

#[derive(Default)]
struct TableState {
    /// Oldest first.
    entries: Vec<Entry>,
    num_unique_samples: i64,
    closed: bool,
}

impl TableState {
    fn position(&self, key: u64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.item.key() == key)
    }

    fn select_index(&self, rng: &mut impl Rng) -> (usize, f64) {
        let total: f64 = self.entries.iter().map(|entry| entry.priority).sum();
        let len = self.entries.len();
        if total <= 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let uniform = 1.0 / len as f64;
            return (rng.gen_range(0..len), uniform);
        }

        let mut target = rng.gen_range(0.0..total);
        for (index, entry) in self.entries.iter().enumerate() {
            if target < entry.priority {
                return (index, entry.priority / total);
            }
            target -= entry.priority;
        }
        // Floating point drift can leave `target` just above the last bucket.
        let last = len - 1;
        (last, self.entries[last].priority / total)
    }
}

/// In-memory [`Table`] guarded by a single mutex.
pub struct InMemoryTable {
    config: TableConfig,
    state: Mutex<TableState>,
    can_sample: Condvar,
}

impl InMemoryTable {
    #[must_use]
    pub fn new(config: TableConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TableState::default()),
            can_sample: Condvar::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &TableConfig {
        &self.config
    }

    fn validate_priority(&self, key: u64, priority: f64) -> Result<()> {
        if priority.is_finite() && priority >= 0.0 {
            return Ok(());
        }
        Err(ReplayError::InvalidArgument(format!(
            "Priority must be a finite non-negative number, got {priority} for item {key} in table {}.",
            self.config.name
        )))
    }

    fn closed_error(&self) -> ReplayError {
        ReplayError::Cancelled(format!("Table {} has been closed.", self.config.name))
    }

    fn sampleable(&self, state: &TableState) -> bool {
        !state.entries.is_empty() && state.entries.len() >= self.config.min_size_to_sample
    }
}

impl Table for InMemoryTable {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn insert_or_assign(&self, item: TableItem) -> Result<()> {
        if item.table() != self.config.name {
            return Err(ReplayError::InvalidArgument(format!(
                "Item {} targets table {} but was inserted into table {}.",
                item.key(),
                item.table(),
                self.config.name
            )));
        }
        let priority = item.item.priority;
        self.validate_priority(item.key(), priority)?;

        let mut state = self.state.lock();
        if state.closed {
            return Err(self.closed_error());
        }

        if let Some(index) = state.position(item.key()) {
            let entry = &mut state.entries[index];
            entry.item = Arc::new(item);
            entry.priority = priority;
        } else {
            state.entries.push(Entry {
                item: Arc::new(item),
                priority,
                times_sampled: 0,
            });
            if state.entries.len() > self.config.max_size {
                let evicted = state.entries.remove(0);
                tracing::trace!(table = %self.config.name, key = evicted.item.key(), "evicted oldest item");
            }
        }

        drop(state);
        self.can_sample.notify_all();
        Ok(())
    }

    fn mutate_items(&self, updates: &[KeyWithPriority], delete_keys: &[u64]) -> Result<()> {
        for update in updates {
            self.validate_priority(update.key, update.priority)?;
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(self.closed_error());
        }

        for update in updates {
            if let Some(index) = state.position(update.key) {
                state.entries[index].priority = update.priority;
            }
        }
        if !delete_keys.is_empty() {
            state
                .entries
                .retain(|entry| !delete_keys.contains(&entry.item.key()));
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.num_unique_samples = 0;
        Ok(())
    }

    fn sample_flexible_batch(
        &self,
        max_batch_size: usize,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SampledItem>> {
        if max_batch_size == 0 {
            return Err(ReplayError::InvalidArgument(
                "max_batch_size must be > 0.".to_string(),
            ));
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        let mut rate_limited = false;

        loop {
            if state.closed {
                return Err(self.closed_error());
            }
            if cancel.is_cancelled() {
                return Err(ReplayError::Cancelled(format!(
                    "Sampling from table {} was cancelled.",
                    self.config.name
                )));
            }
            if self.sampleable(&state) {
                break;
            }
            rate_limited = true;

            // Cancellation does not notify the condvar, so waits are sliced.
            let now = Instant::now();
            let wake_at = match deadline {
                Some(deadline) if deadline <= now => {
                    return Err(ReplayError::DeadlineExceeded(format!(
                        "Rate limiter timeout exceeded while sampling from table {}.",
                        self.config.name
                    )));
                }
                Some(deadline) => deadline.min(now + CANCEL_POLL_INTERVAL),
                None => now + CANCEL_POLL_INTERVAL,
            };
            self.can_sample.wait_until(&mut state, wake_at);
        }

        let mut rng = rand::thread_rng();
        let mut samples = Vec::with_capacity(max_batch_size);
        while samples.len() < max_batch_size && self.sampleable(&state) {
            let table_size = i64::try_from(state.entries.len()).unwrap_or(i64::MAX);
            let (index, probability) = state.select_index(&mut rng);

            let entry = &mut state.entries[index];
            entry.times_sampled += 1;
            let first_sample = entry.times_sampled == 1;
            let exhausted = self.config.max_times_sampled > 0
                && entry.times_sampled >= self.config.max_times_sampled;
            samples.push(SampledItem {
                item: Arc::clone(&entry.item),
                priority: entry.priority,
                times_sampled: entry.times_sampled,
                probability,
                table_size,
                rate_limited,
            });

            if first_sample {
                state.num_unique_samples += 1;
            }
            if exhausted {
                state.entries.remove(index);
            }
        }

        Ok(samples)
    }

    fn default_flexible_batch_size(&self) -> usize {
        self.config.default_flexible_batch_size.max(1)
    }

    fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn info(&self) -> TableInfo {
        let state = self.state.lock();
        TableInfo {
            name: self.config.name.clone(),
            max_size: i64::try_from(self.config.max_size).unwrap_or(i64::MAX),
            max_times_sampled: self.config.max_times_sampled,
            rate_limiter_info: Some(RateLimiterInfo {
                min_size_to_sample: i64::try_from(self.config.min_size_to_sample)
                    .unwrap_or(i64::MAX),
            }),
            current_size: i64::try_from(state.entries.len()).unwrap_or(i64::MAX),
            num_unique_samples: state.num_unique_samples,
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.can_sample.notify_all();
        tracing::debug!(table = %self.config.name, "table closed");
    }
}

impl fmt::Display for InMemoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InMemoryTable(name={}, max_size={}, max_times_sampled={}, min_size_to_sample={})",
            self.config.name,
            self.config.max_size,
            self.config.max_times_sampled,
            self.config.min_size_to_sample
        )
    }
}
