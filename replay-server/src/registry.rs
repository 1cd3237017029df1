//! Table registry: the immutable name → table map shared by every stream,
//! together with the chunk store and the optional checkpointer.
//!
//! The registry is built once at startup, either from a restored checkpoint
//! or from the tables handed to [`TableRegistry::initialize`], and is never
//! mutated afterwards. Lookups therefore need no locking; table contents are
//! synchronized by the tables themselves.

use replay_core::{Checkpointer, ChunkStore, ReplayError, Table};
use replay_proto::{KeyWithPriority, ServerInfoResponse, Uint128};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ServiceError;

/// Process-lifetime registry of priority tables.
pub struct TableRegistry {
    tables: BTreeMap<String, Arc<dyn Table>>,
    chunk_store: Arc<ChunkStore>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    tables_state_id: u128,
    closed: AtomicBool,
}

impl TableRegistry {
    /// Build the registry.
    ///
    /// With a checkpointer, the latest checkpoint of its root directory is
    /// restored first; when there is none, the fallback checkpoint is tried.
    /// A restored checkpoint replaces `tables`. When neither exists the
    /// provided tables are used as-is.
    ///
    /// # Errors
    ///
    /// Any checkpointer failure other than "not found", and duplicate table
    /// names.
    pub fn initialize(
        tables: Vec<Arc<dyn Table>>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
    ) -> Result<Self, ReplayError> {
        let chunk_store = Arc::new(ChunkStore::new());
        let tables = match &checkpointer {
            Some(checkpointer) => restore(checkpointer.as_ref(), &chunk_store)?.unwrap_or(tables),
            None => tables,
        };

        let mut by_name = BTreeMap::new();
        for table in tables {
            let name = table.name().to_string();
            if by_name.insert(name.clone(), table).is_some() {
                return Err(ReplayError::InvalidArgument(format!(
                    "Table {name} was provided more than once."
                )));
            }
        }

        let registry = Self {
            tables: by_name,
            chunk_store,
            checkpointer,
            tables_state_id: rand::random::<u128>(),
            closed: AtomicBool::new(false),
        };
        tracing::debug!(tables = registry.tables.len(), "table registry initialized");
        Ok(registry)
    }

    /// Look up a table by name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Table>> {
        self.tables.get(name).map(Arc::clone)
    }

    /// Look up a table by name, failing with `NotFound` when it is unknown.
    ///
    /// # Errors
    ///
    /// [`ServiceError::TableNotFound`].
    pub fn table(&self, name: &str) -> Result<Arc<dyn Table>, ServiceError> {
        self.resolve(name)
            .ok_or_else(|| ServiceError::table_not_found(name))
    }

    /// Snapshot of the name → table map.
    #[must_use]
    pub fn tables(&self) -> BTreeMap<String, Arc<dyn Table>> {
        self.tables.clone()
    }

    #[must_use]
    pub const fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.chunk_store
    }

    #[must_use]
    pub const fn tables_state_id(&self) -> u128 {
        self.tables_state_id
    }

    /// Save every table through the configured checkpointer and return the
    /// checkpoint path.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` without a checkpointer, otherwise whatever the
    /// checkpointer reports.
    pub fn checkpoint(&self) -> Result<String, ServiceError> {
        let Some(checkpointer) = &self.checkpointer else {
            return Err(ServiceError::InvalidArgument(
                "no Checkpointer configured for the replay service.".to_string(),
            ));
        };

        let tables: Vec<Arc<dyn Table>> = self.tables.values().map(Arc::clone).collect();
        let path = checkpointer.save(&tables, 1)?;
        tracing::info!(path = %path, "Stored checkpoint");
        Ok(path)
    }

    /// Update priorities and delete items of one table.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown table, otherwise the table's error.
    pub fn mutate_priorities(
        &self,
        table: &str,
        updates: &[KeyWithPriority],
        delete_keys: &[u64],
    ) -> Result<(), ServiceError> {
        self.table(table)?.mutate_items(updates, delete_keys)?;
        Ok(())
    }

    /// Remove every item of one table.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown table, otherwise the table's error.
    pub fn reset(&self, table: &str) -> Result<(), ServiceError> {
        self.table(table)?.reset()?;
        Ok(())
    }

    /// Info records of every table plus the tables state id.
    #[must_use]
    pub fn server_info(&self) -> ServerInfoResponse {
        ServerInfoResponse {
            table_info: self.tables.values().map(|table| table.info()).collect(),
            tables_state_id: Some(Uint128::from_u128(self.tables_state_id)),
        }
    }

    /// Close every table and the chunk store. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for table in self.tables.values() {
            table.close();
        }
        self.chunk_store.close();
        tracing::info!(tables = self.tables.len(), "table registry closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Returns `None` when neither the latest nor the fallback checkpoint exists.
fn restore(
    checkpointer: &dyn Checkpointer,
    chunk_store: &ChunkStore,
) -> Result<Option<Vec<Arc<dyn Table>>>, ReplayError> {
    let restored = match checkpointer.load_latest(chunk_store) {
        Err(err) if err.is_not_found() => {
            tracing::debug!("no checkpoint in root directory, trying fallback checkpoint");
            checkpointer.load_fallback_checkpoint(chunk_store)
        }
        other => other,
    };

    match restored {
        Ok(tables) => {
            tracing::info!(
                checkpointer = %checkpointer,
                tables = tables.len(),
                "restored tables from checkpoint"
            );
            Ok(Some(tables))
        }
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

impl fmt::Display for TableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplayService(tables=[")?;
        for (index, table) in self.tables.values().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{table}")?;
        }
        match &self.checkpointer {
            Some(checkpointer) => write!(f, "], checkpointer={checkpointer})"),
            None => write!(f, "], checkpointer=nullptr)"),
        }
    }
}
