//! Replay service: table registry, insert and sample stream pipelines, the
//! in-process connection bootstrap and the facade tying them together.

#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod insert;
pub mod registry;
pub mod sample;
pub mod service;

pub use bootstrap::{HandoffRegistry, connect_local, is_local_peer, local_address_space};
pub use config::{ConfigManager, ServerConfig};
pub use error::ServiceError;
pub use registry::TableRegistry;
pub use sample::{MAX_SAMPLE_RESPONSE_SIZE_BYTES, pack_sample};
pub use service::{ReplayService, ServiceOptions};
