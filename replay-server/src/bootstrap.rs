//! Same-address-space connection bootstrap.
//!
//! A client living in the server's process can skip the wire entirely and use
//! the server's table handle directly. The server never sends a pointer:
//! it parks the handle in a process-local [`HandoffRegistry`] under an opaque
//! token, and only a caller holding the same registry can claim it. The
//! exchange is gated on the pid and on an address-space id that only code
//! in this process can know.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use replay_core::Table;
use replay_proto::{InitializeConnectionRequest, InitializeConnectionResponse, Uint128};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

use crate::error::ServiceError;
use crate::registry::TableRegistry;
use crate::service::ReplayService;

/// Identifier of this process's address space, fixed for its lifetime.
///
/// Never zero.
#[must_use]
pub fn local_address_space() -> u128 {
    static ADDRESS_SPACE: OnceLock<u128> = OnceLock::new();
    *ADDRESS_SPACE.get_or_init(|| rand::random::<u128>().max(1))
}

fn local_pid() -> i64 {
    i64::from(std::process::id())
}

/// Whether a transport peer string names a loopback or in-process peer.
///
/// Accepts `ipv4:`/`ipv6:` prefixed loopback socket addresses (including the
/// percent-encoded brackets some transports emit), `unix:` sockets,
/// `inproc` channels, `localhost` and bare loopback addresses.
#[must_use]
pub fn is_local_peer(peer: &str) -> bool {
    if peer.starts_with("unix:") || peer.starts_with("inproc") {
        return true;
    }

    let address = peer
        .strip_prefix("ipv4:")
        .or_else(|| peer.strip_prefix("ipv6:"))
        .unwrap_or(peer)
        .replace("%5B", "[")
        .replace("%5D", "]");

    if address == "localhost" || address.starts_with("localhost:") {
        return true;
    }
    if let Ok(socket) = address.parse::<SocketAddr>() {
        return socket.ip().is_loopback();
    }
    address
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}

/// Table handles waiting to be claimed by an in-process client.
#[derive(Default)]
pub struct HandoffRegistry {
    slots: DashMap<u64, Arc<dyn Table>>,
}

impl HandoffRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `table` under a fresh non-zero token.
    ///
    /// The registration is withdrawn when the returned guard is dropped
    /// unless the token was claimed first.
    pub fn register(&self, table: Arc<dyn Table>) -> PendingHandoff<'_> {
        loop {
            let token = rand::random::<u64>();
            if token == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.slots.entry(token) {
                slot.insert(table);
                return PendingHandoff {
                    registry: self,
                    token,
                };
            }
        }
    }

    /// Take the handle parked under `token`.
    #[must_use]
    pub fn claim(&self, token: u64) -> Option<Arc<dyn Table>> {
        self.slots.remove(&token).map(|(_, table)| table)
    }

    /// Number of handles not yet claimed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

/// Server-side guard over one parked handle.
pub struct PendingHandoff<'a> {
    registry: &'a HandoffRegistry,
    token: u64,
}

impl PendingHandoff<'_> {
    #[must_use]
    pub const fn token(&self) -> u64 {
        self.token
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        !self.registry.slots.contains_key(&self.token)
    }
}

impl Drop for PendingHandoff<'_> {
    fn drop(&mut self) {
        if self.registry.slots.remove(&self.token).is_some() {
            tracing::debug!(token = self.token, "withdrew unclaimed table handoff");
        }
    }
}

/// Serve one `InitializeConnection` exchange.
///
/// # Errors
///
/// Unknown tables, a stream that closes before the exchange completes, and
/// confirmations for a token nobody claimed.
pub async fn run_initialize_connection<S>(
    registry: &TableRegistry,
    handoffs: &HandoffRegistry,
    peer: &str,
    mut inbound: S,
    responses: mpsc::Sender<Result<InitializeConnectionResponse, Status>>,
) -> Result<(), ServiceError>
where
    S: Stream<Item = Result<InitializeConnectionRequest, Status>> + Unpin,
{
    if !is_local_peer(peer) {
        tracing::debug!(peer, "remote peer, skipping local connection bootstrap");
        return Ok(());
    }

    let request = read(&mut inbound).await.ok_or_else(read_failed)?;

    let same_process = request.pid == local_pid()
        && request.address_space.as_ref().map(Uint128::to_u128) == Some(local_address_space());
    if !same_process {
        tracing::debug!(peer, pid = request.pid, "client runs in another address space");
        return send(&responses, 0).await;
    }

    let table = registry.table(&request.table_name)?;
    let pending = handoffs.register(table);
    send(&responses, pending.token()).await?;

    match read(&mut inbound).await {
        Some(confirmation) if !confirmation.ownership_transferred => Err(
            ServiceError::ProtocolViolation("Received unexpected request".to_string()),
        ),
        Some(_) if !pending.is_claimed() => Err(ServiceError::ProtocolViolation(format!(
            "Ownership of handle {} confirmed but never claimed.",
            pending.token()
        ))),
        Some(_) => {
            tracing::debug!(
                peer,
                table = %request.table_name,
                "handed table to in-process client"
            );
            Ok(())
        }
        None => Err(read_failed()),
    }
}

fn read_failed() -> ServiceError {
    ServiceError::ProtocolViolation("Failed to read from stream".to_string())
}

async fn read<S>(inbound: &mut S) -> Option<InitializeConnectionRequest>
where
    S: Stream<Item = Result<InitializeConnectionRequest, Status>> + Unpin,
{
    match inbound.next().await? {
        Ok(request) => Some(request),
        Err(status) => {
            tracing::debug!(error = %status, "Failed to read from stream");
            None
        }
    }
}

async fn send(
    responses: &mpsc::Sender<Result<InitializeConnectionResponse, Status>>,
    handle: u64,
) -> Result<(), ServiceError> {
    responses
        .send(Ok(InitializeConnectionResponse { handle }))
        .await
        .map_err(|_| ServiceError::WriteFailed("Failed to write to stream.".to_string()))
}

/// Obtain a direct handle to `table_name` from a service in this process.
///
/// Returns `Ok(None)` when the service declined the fast path and the caller
/// should fall back to the streaming RPCs.
///
/// # Errors
///
/// The status the service ended the exchange with.
pub async fn connect_local(
    service: &ReplayService,
    table_name: &str,
) -> Result<Option<Arc<dyn Table>>, Status> {
    let (tx, rx) = mpsc::channel(2);
    let mut responses = service.initialize_connection("inproc", ReceiverStream::new(rx));

    let hello = InitializeConnectionRequest {
        pid: local_pid(),
        table_name: table_name.to_string(),
        ownership_transferred: false,
        address_space: Some(Uint128::from_u128(local_address_space())),
    };
    tx.send(Ok(hello))
        .await
        .map_err(|_| Status::internal("Failed to write to stream."))?;

    let Some(first) = responses.next().await else {
        return Ok(None);
    };
    let handle = first?.handle;
    if handle == 0 {
        return Ok(None);
    }

    let table = service
        .handoffs()
        .claim(handle)
        .ok_or_else(|| Status::internal(format!("Handle {handle} is not registered.")))?;

    let confirmation = InitializeConnectionRequest {
        ownership_transferred: true,
        ..InitializeConnectionRequest::default()
    };
    tx.send(Ok(confirmation))
        .await
        .map_err(|_| Status::internal("Failed to write to stream."))?;
    drop(tx);

    while let Some(result) = responses.next().await {
        result?;
    }
    Ok(Some(table))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use replay_core::{InMemoryTable, TableConfig};

    #[test]
    fn test_local_peer_detection() {
        assert!(is_local_peer("ipv4:127.0.0.1:50051"));
        assert!(is_local_peer("ipv6:[::1]:50051"));
        assert!(is_local_peer("ipv6:%5B::1%5D:50051"));
        assert!(is_local_peer("unix:/tmp/replay.sock"));
        assert!(is_local_peer("inproc"));
        assert!(is_local_peer("localhost:50051"));
        assert!(is_local_peer("127.0.0.1:9000"));

        assert!(!is_local_peer("ipv4:10.0.0.7:50051"));
        assert!(!is_local_peer("ipv6:[2001:db8::1]:50051"));
        assert!(!is_local_peer("dns:replay.example:443"));
    }

    #[test]
    fn test_address_space_is_stable_and_non_zero() {
        assert_ne!(local_address_space(), 0);
        assert_eq!(local_address_space(), local_address_space());
    }

    #[test]
    fn test_unclaimed_handoff_is_withdrawn_on_drop() {
        let handoffs = HandoffRegistry::new();
        let table: Arc<dyn Table> = Arc::new(InMemoryTable::new(TableConfig::named("t")));

        let token = {
            let pending = handoffs.register(Arc::clone(&table));
            assert_ne!(pending.token(), 0);
            assert_eq!(handoffs.pending(), 1);
            pending.token()
        };
        assert_eq!(handoffs.pending(), 0);
        assert!(handoffs.claim(token).is_none());
    }

    #[test]
    fn test_claim_hands_over_same_handle() {
        let handoffs = HandoffRegistry::new();
        let table: Arc<dyn Table> = Arc::new(InMemoryTable::new(TableConfig::named("t")));
        let pending = handoffs.register(Arc::clone(&table));

        let claimed = handoffs.claim(pending.token()).unwrap();
        assert!(pending.is_claimed());
        assert!(Arc::ptr_eq(&claimed, &table));
        assert!(handoffs.claim(pending.token()).is_none());
    }
}
