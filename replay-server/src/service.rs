//! Service facade: the RPC surface of the replay service.
//!
//! Streaming calls spawn one task per stream and hand back the receiving end
//! of a bounded channel, the shape a tonic server expects from a streaming
//! handler. Unary calls delegate to the [`TableRegistry`].

use replay_core::{Checkpointer, ReplayError, Table};
use replay_proto::{
    CheckpointRequest, CheckpointResponse, InitializeConnectionRequest,
    InitializeConnectionResponse, InsertStreamRequest, InsertStreamResponse,
    MutatePrioritiesRequest, MutatePrioritiesResponse, ResetRequest, ResetResponse,
    SampleStreamRequest, SampleStreamResponse, ServerInfoRequest, ServerInfoResponse,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

use crate::bootstrap::{HandoffRegistry, run_initialize_connection};
use crate::error::ServiceError;
use crate::insert::run_insert_stream;
use crate::registry::TableRegistry;
use crate::sample::{MAX_SAMPLE_RESPONSE_SIZE_BYTES, run_sample_stream};

const INSERT_RESPONSE_BUFFER: usize = 32;
/// Sample responses can be tens of MiB each; keep few in flight.
const SAMPLE_RESPONSE_BUFFER: usize = 2;
const BOOTSTRAP_RESPONSE_BUFFER: usize = 2;

/// Tunables of the service facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Soft limit on the encoded size of one sample response.
    pub max_sample_response_bytes: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_sample_response_bytes: MAX_SAMPLE_RESPONSE_SIZE_BYTES,
        }
    }
}

/// Replay service bound to one table registry.
pub struct ReplayService {
    registry: Arc<TableRegistry>,
    handoffs: Arc<HandoffRegistry>,
    options: ServiceOptions,
    shutdown: CancellationToken,
}

impl ReplayService {
    #[must_use]
    pub fn new(registry: TableRegistry, options: ServiceOptions) -> Self {
        Self {
            registry: Arc::new(registry),
            handoffs: Arc::new(HandoffRegistry::new()),
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Initialize the registry (restoring from `checkpointer` when possible)
    /// and wrap it in a service.
    ///
    /// # Errors
    ///
    /// See [`TableRegistry::initialize`].
    pub fn create(
        tables: Vec<Arc<dyn Table>>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        options: ServiceOptions,
    ) -> Result<Self, ReplayError> {
        let registry = TableRegistry::initialize(tables, checkpointer)?;
        Ok(Self::new(registry, options))
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// Handles parked for in-process clients.
    #[must_use]
    pub fn handoffs(&self) -> &HandoffRegistry {
        &self.handoffs
    }

    #[must_use]
    pub const fn options(&self) -> &ServiceOptions {
        &self.options
    }

    #[must_use]
    pub fn tables(&self) -> BTreeMap<String, Arc<dyn Table>> {
        self.registry.tables()
    }

    #[must_use]
    pub fn tables_state_id(&self) -> u128 {
        self.registry.tables_state_id()
    }

    /// Open an insert stream over `inbound`.
    ///
    /// The returned stream yields confirmations and ends with the stream's
    /// terminal error, if any.
    pub fn insert_stream<S>(&self, inbound: S) -> ReceiverStream<Result<InsertStreamResponse, Status>>
    where
        S: Stream<Item = Result<InsertStreamRequest, Status>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(INSERT_RESPONSE_BUFFER);
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            tracing::debug!("insert stream opened");
            if let Err(err) = run_insert_stream(registry, inbound, tx.clone()).await {
                log_stream_error("insert", &err);
                let _ = tx.send(Err(err.into())).await;
            }
        });

        ReceiverStream::new(rx)
    }

    /// Open a sample stream over `inbound`.
    ///
    /// Dropping the returned stream, or closing the service, cancels the
    /// stream.
    pub fn sample_stream<S>(&self, inbound: S) -> ReceiverStream<Result<SampleStreamResponse, Status>>
    where
        S: Stream<Item = Result<SampleStreamRequest, Status>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(SAMPLE_RESPONSE_BUFFER);
        let registry = Arc::clone(&self.registry);
        let cancel = self.shutdown.child_token();
        let max_response_bytes = self.options.max_sample_response_bytes;

        tokio::spawn(async move {
            let result =
                run_sample_stream(registry, inbound, tx.clone(), cancel, max_response_bytes).await;
            if let Err(err) = result {
                log_stream_error("sample", &err);
                let _ = tx.send(Err(err.into())).await;
            }
        });

        ReceiverStream::new(rx)
    }

    /// Run the same-address-space bootstrap for `peer`.
    ///
    /// Remote peers get an empty stream that ends successfully.
    pub fn initialize_connection<S>(
        &self,
        peer: impl Into<String>,
        inbound: S,
    ) -> ReceiverStream<Result<InitializeConnectionResponse, Status>>
    where
        S: Stream<Item = Result<InitializeConnectionRequest, Status>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(BOOTSTRAP_RESPONSE_BUFFER);
        let registry = Arc::clone(&self.registry);
        let handoffs = Arc::clone(&self.handoffs);
        let peer = peer.into();

        tokio::spawn(async move {
            let result =
                run_initialize_connection(&registry, &handoffs, &peer, inbound, tx.clone()).await;
            if let Err(err) = result {
                log_stream_error("initialize_connection", &err);
                let _ = tx.send(Err(err.into())).await;
            }
        });

        ReceiverStream::new(rx)
    }

    /// Update priorities of, and delete, items of one table.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown table; table errors otherwise.
    pub async fn mutate_priorities(
        &self,
        request: MutatePrioritiesRequest,
    ) -> Result<MutatePrioritiesResponse, Status> {
        self.registry
            .mutate_priorities(&request.table, &request.updates, &request.delete_keys)?;
        Ok(MutatePrioritiesResponse {})
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown table; table errors otherwise.
    pub async fn reset(&self, request: ResetRequest) -> Result<ResetResponse, Status> {
        self.registry.reset(&request.table)?;
        Ok(ResetResponse {})
    }

    /// Save all tables through the configured checkpointer.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` without a checkpointer; checkpointer errors
    /// otherwise.
    pub async fn checkpoint(
        &self,
        _request: CheckpointRequest,
    ) -> Result<CheckpointResponse, Status> {
        let registry = Arc::clone(&self.registry);
        let checkpoint_path = tokio::task::spawn_blocking(move || registry.checkpoint())
            .await
            .map_err(|err| Status::internal(format!("Checkpoint task failed: {err}")))??;
        Ok(CheckpointResponse { checkpoint_path })
    }

    /// # Errors
    ///
    /// Never fails; the signature matches the other RPCs.
    pub async fn server_info(
        &self,
        _request: ServerInfoRequest,
    ) -> Result<ServerInfoResponse, Status> {
        Ok(self.registry.server_info())
    }

    /// Cancel every open sample stream and close all tables and the chunk
    /// store.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.registry.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.registry.is_closed()
    }
}

fn log_stream_error(stream: &'static str, err: &ServiceError) {
    match err.code() {
        Code::Internal => tracing::warn!(stream, error = %err, "stream ended with an error"),
        _ => tracing::debug!(stream, error = %err, "stream ended with an error"),
    }
}

impl fmt::Display for ReplayService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.registry, f)
    }
}
