//! Protocol buffer messages for the replay service.
//!
//! The message structs are declared with `prost` derives directly so the crate
//! builds without a `protoc` toolchain. Field tags are part of the wire
//! contract and must never be renumbered.

#![allow(clippy::derive_partial_eq_without_eq)]

use prost_types::Timestamp;
use std::collections::HashSet;
use std::time::SystemTime;

/// 128-bit unsigned integer split into two 64-bit halves.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Uint128 {
    #[prost(uint64, tag = "1")]
    pub high: u64,
    #[prost(uint64, tag = "2")]
    pub low: u64,
}

/// Range of timesteps of one episode covered by a chunk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SequenceRange {
    #[prost(uint64, tag = "1")]
    pub episode_id: u64,
    /// First timestep (inclusive).
    #[prost(int32, tag = "2")]
    pub start: i32,
    /// Last timestep (inclusive).
    #[prost(int32, tag = "3")]
    pub end: i32,
}

/// Immutable, already-compressed block of trajectory data.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkData {
    /// Content address of the chunk. Unique within a chunk store.
    #[prost(uint64, tag = "1")]
    pub chunk_key: u64,
    /// Compressed payload. Cloning shares the underlying buffer.
    #[prost(bytes = "bytes", tag = "2")]
    pub data: ::prost::bytes::Bytes,
    #[prost(message, optional, tag = "3")]
    pub sequence_range: ::core::option::Option<SequenceRange>,
    #[prost(bool, tag = "4")]
    pub delta_encoded: bool,
    #[prost(int64, tag = "5")]
    pub data_uncompressed_size: i64,
}

/// Reference to a contiguous slice of one chunk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkSlice {
    #[prost(uint64, tag = "1")]
    pub chunk_key: u64,
    #[prost(int32, tag = "2")]
    pub offset: i32,
    #[prost(int32, tag = "3")]
    pub length: i32,
    /// Index of the tensor within the chunk.
    #[prost(int32, tag = "4")]
    pub index: i32,
}

/// Column-major description of which chunk slices form an item.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlatTrajectory {
    #[prost(message, repeated, tag = "1")]
    pub columns: ::prost::alloc::vec::Vec<flat_trajectory::Column>,
}

/// Nested message types of [`FlatTrajectory`].
pub mod flat_trajectory {
    /// One column of a trajectory, built from consecutive chunk slices.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Column {
        #[prost(message, repeated, tag = "1")]
        pub chunk_slices: ::prost::alloc::vec::Vec<super::ChunkSlice>,
        /// Column holds a single step whose batch dimension is dropped.
        #[prost(bool, tag = "2")]
        pub squeeze: bool,
    }
}

/// Item stored in a priority table.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrioritizedItem {
    #[prost(uint64, tag = "1")]
    pub key: u64,
    #[prost(string, tag = "2")]
    pub table: ::prost::alloc::string::String,
    #[prost(double, tag = "3")]
    pub priority: f64,
    #[prost(int32, tag = "4")]
    pub times_sampled: i32,
    #[prost(message, optional, tag = "5")]
    pub inserted_at: ::core::option::Option<Timestamp>,
    #[prost(message, optional, tag = "6")]
    pub flat_trajectory: ::core::option::Option<FlatTrajectory>,
}

/// Priority update for a single item.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyWithPriority {
    #[prost(uint64, tag = "1")]
    pub key: u64,
    #[prost(double, tag = "2")]
    pub priority: f64,
}

/// Item carried by an insert request together with cache instructions.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InsertItem {
    #[prost(message, optional, tag = "1")]
    pub item: ::core::option::Option<PrioritizedItem>,
    /// Chunks the server should keep cached for later items on the stream.
    #[prost(uint64, repeated, tag = "2")]
    pub keep_chunk_keys: ::prost::alloc::vec::Vec<u64>,
    #[prost(bool, tag = "3")]
    pub send_confirmation: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InsertStreamRequest {
    #[prost(message, repeated, tag = "1")]
    pub chunks: ::prost::alloc::vec::Vec<ChunkData>,
    #[prost(message, optional, tag = "2")]
    pub item: ::core::option::Option<InsertItem>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InsertStreamResponse {
    #[prost(uint64, repeated, tag = "1")]
    pub keys: ::prost::alloc::vec::Vec<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Timeout {
    #[prost(int64, tag = "1")]
    pub milliseconds: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleStreamRequest {
    #[prost(string, tag = "1")]
    pub table: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub num_samples: i64,
    /// Only read from the first request of a stream.
    #[prost(message, optional, tag = "3")]
    pub rate_limiter_timeout: ::core::option::Option<Timeout>,
    /// Positive batch size, or `-1` to use the table default.
    #[prost(int32, tag = "4")]
    pub flexible_batch_size: i32,
}

/// Sampling metadata attached to the first chunk of every sampled item.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleInfo {
    #[prost(message, optional, tag = "1")]
    pub item: ::core::option::Option<PrioritizedItem>,
    #[prost(double, tag = "2")]
    pub probability: f64,
    #[prost(int64, tag = "3")]
    pub table_size: i64,
    #[prost(bool, tag = "4")]
    pub rate_limited: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleEntry {
    #[prost(message, repeated, tag = "1")]
    pub data: ::prost::alloc::vec::Vec<ChunkData>,
    #[prost(message, optional, tag = "2")]
    pub info: ::core::option::Option<SampleInfo>,
    /// Set on the entry carrying the final chunk of an item.
    #[prost(bool, tag = "3")]
    pub end_of_sequence: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleStreamResponse {
    #[prost(message, repeated, tag = "1")]
    pub entries: ::prost::alloc::vec::Vec<SampleEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MutatePrioritiesRequest {
    #[prost(string, tag = "1")]
    pub table: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub updates: ::prost::alloc::vec::Vec<KeyWithPriority>,
    #[prost(uint64, repeated, tag = "3")]
    pub delete_keys: ::prost::alloc::vec::Vec<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MutatePrioritiesResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResetRequest {
    #[prost(string, tag = "1")]
    pub table: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResetResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckpointRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckpointResponse {
    #[prost(string, tag = "1")]
    pub checkpoint_path: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RateLimiterInfo {
    #[prost(int64, tag = "1")]
    pub min_size_to_sample: i64,
}

/// Snapshot of a table used for server info reporting.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableInfo {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub max_size: i64,
    #[prost(int32, tag = "3")]
    pub max_times_sampled: i32,
    #[prost(message, optional, tag = "4")]
    pub rate_limiter_info: ::core::option::Option<RateLimiterInfo>,
    #[prost(int64, tag = "5")]
    pub current_size: i64,
    #[prost(int64, tag = "6")]
    pub num_unique_samples: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerInfoRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerInfoResponse {
    #[prost(message, repeated, tag = "1")]
    pub table_info: ::prost::alloc::vec::Vec<TableInfo>,
    #[prost(message, optional, tag = "2")]
    pub tables_state_id: ::core::option::Option<Uint128>,
}

/// Bootstrap request of the same-address-space fast path.
///
/// The first message names the table; the second one confirms that the
/// handle behind the returned token has been claimed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitializeConnectionRequest {
    #[prost(int64, tag = "1")]
    pub pid: i64,
    #[prost(string, tag = "2")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(bool, tag = "3")]
    pub ownership_transferred: bool,
    /// Address-space capability of the caller.
    #[prost(message, optional, tag = "4")]
    pub address_space: ::core::option::Option<Uint128>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitializeConnectionResponse {
    /// Handoff token, `0` when the fast path is not available to the caller.
    #[prost(uint64, tag = "1")]
    pub handle: u64,
}

impl Uint128 {
    /// Split a native `u128` into its wire representation.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_u128(value: u128) -> Self {
        Self {
            high: (value >> 64) as u64,
            low: value as u64,
        }
    }

    /// Reassemble the native value.
    #[must_use]
    pub const fn to_u128(&self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }
}

impl ChunkData {
    /// Create a chunk with the given key and payload and no sequence metadata.
    pub fn new(chunk_key: u64, data: impl Into<::prost::bytes::Bytes>) -> Self {
        let data = data.into();
        Self {
            chunk_key,
            data_uncompressed_size: i64::try_from(data.len()).unwrap_or(i64::MAX),
            data,
            sequence_range: None,
            delta_encoded: false,
        }
    }

    /// Attach the episode range covered by this chunk.
    #[must_use]
    pub fn with_sequence_range(mut self, episode_id: u64, start: i32, end: i32) -> Self {
        self.sequence_range = Some(SequenceRange {
            episode_id,
            start,
            end,
        });
        self
    }
}

impl FlatTrajectory {
    /// Build a single-column trajectory where each chunk is referenced whole.
    ///
    /// `lengths[i]` is the number of steps held by `chunk_keys[i]`.
    #[must_use]
    pub fn from_chunks(chunk_keys: &[u64], lengths: &[i32]) -> Self {
        let chunk_slices = chunk_keys
            .iter()
            .zip(lengths)
            .map(|(&chunk_key, &length)| ChunkSlice {
                chunk_key,
                offset: 0,
                length,
                index: 0,
            })
            .collect();
        Self {
            columns: vec![flat_trajectory::Column {
                chunk_slices,
                squeeze: false,
            }],
        }
    }

    /// Distinct chunk keys referenced by the trajectory, in order of first
    /// appearance across columns.
    #[must_use]
    pub fn chunk_keys(&self) -> Vec<u64> {
        let mut seen = HashSet::new();
        self.columns
            .iter()
            .flat_map(|column| &column.chunk_slices)
            .map(|slice| slice.chunk_key)
            .filter(|key| seen.insert(*key))
            .collect()
    }
}

impl PrioritizedItem {
    /// Create an item for `table` with an empty trajectory.
    pub fn new(key: u64, table: impl Into<String>, priority: f64) -> Self {
        Self {
            key,
            table: table.into(),
            priority,
            times_sampled: 0,
            inserted_at: Some(Timestamp::from(SystemTime::now())),
            flat_trajectory: None,
        }
    }

    /// Set the trajectory the item is built from.
    #[must_use]
    pub fn with_trajectory(mut self, trajectory: FlatTrajectory) -> Self {
        self.flat_trajectory = Some(trajectory);
        self
    }

    /// Chunk keys of the item's trajectory; empty when no trajectory is set.
    #[must_use]
    pub fn chunk_keys(&self) -> Vec<u64> {
        self.flat_trajectory
            .as_ref()
            .map(FlatTrajectory::chunk_keys)
            .unwrap_or_default()
    }
}

impl InsertStreamRequest {
    /// Request carrying only chunks.
    #[must_use]
    pub fn with_chunks(chunks: Vec<ChunkData>) -> Self {
        Self { chunks, item: None }
    }

    /// Request carrying an item, optionally preceded by new chunks.
    #[must_use]
    pub fn with_item(
        chunks: Vec<ChunkData>,
        item: PrioritizedItem,
        keep_chunk_keys: Vec<u64>,
        send_confirmation: bool,
    ) -> Self {
        Self {
            chunks,
            item: Some(InsertItem {
                item: Some(item),
                keep_chunk_keys,
                send_confirmation,
            }),
        }
    }
}

impl SampleStreamRequest {
    /// Request `num_samples` items from `table` using the table's default
    /// flexible batch size.
    pub fn new(table: impl Into<String>, num_samples: i64) -> Self {
        Self {
            table: table.into(),
            num_samples,
            rate_limiter_timeout: None,
            flexible_batch_size: -1,
        }
    }

    #[must_use]
    pub const fn with_flexible_batch_size(mut self, flexible_batch_size: i32) -> Self {
        self.flexible_batch_size = flexible_batch_size;
        self
    }

    #[must_use]
    pub const fn with_timeout_ms(mut self, milliseconds: i64) -> Self {
        self.rate_limiter_timeout = Some(Timeout { milliseconds });
        self
    }
}
