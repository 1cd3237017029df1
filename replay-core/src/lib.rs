//! Core building blocks of the replay service: the deduplicating chunk store,
//! the priority table contract and the checkpointer contract.

#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

pub mod checkpoint;
pub mod chunk_store;
pub mod error;
pub mod table;

pub use checkpoint::Checkpointer;
pub use chunk_store::{Chunk, ChunkKey, ChunkStore};
pub use error::{ReplayError, Result};
pub use table::{
    AUTO_SELECT_FLEXIBLE_BATCH_SIZE, InMemoryTable, SampledItem, Table, TableConfig, TableItem,
};
