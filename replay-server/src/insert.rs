//! Insert stream pipeline.
//!
//! A background reader pulls requests off the transport into a depth-1 queue
//! so that the next read overlaps with processing of the current request.
//! Chunks are deduplicated through the shared [`ChunkStore`] and kept in a
//! per-stream cache until the client stops listing them in
//! `keep_chunk_keys`.
//!
//! [`ChunkStore`]: replay_core::ChunkStore

use replay_core::{Chunk, ChunkKey, TableItem};
use replay_proto::{InsertItem, InsertStreamRequest, InsertStreamResponse};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

use crate::error::ServiceError;
use crate::registry::TableRegistry;

/// Requests read ahead of processing.
const REQUEST_QUEUE_DEPTH: usize = 1;

/// Read-ahead queue between the transport and the insert loop.
///
/// Dropping the queue closes it and aborts the reader, whichever path the
/// insert loop leaves by.
struct RequestQueue {
    rx: mpsc::Receiver<InsertStreamRequest>,
    reader: JoinHandle<()>,
}

impl RequestQueue {
    fn spawn<S>(mut inbound: S) -> Self
    where
        S: Stream<Item = Result<InsertStreamRequest, Status>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let reader = tokio::spawn(async move {
            while let Some(next) = inbound.next().await {
                match next {
                    Ok(request) => {
                        if tx.send(request).await.is_err() {
                            break;
                        }
                    }
                    Err(status) => {
                        tracing::debug!(error = %status, "Failed to read from stream");
                        break;
                    }
                }
            }
        });
        Self { rx, reader }
    }

    /// Next request, or `None` once the peer is done.
    async fn pop(&mut self) -> Option<InsertStreamRequest> {
        self.rx.recv().await
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.rx.close();
        self.reader.abort();
    }
}

/// Chunks received on one stream and not yet released by the client.
#[derive(Debug, Default)]
pub struct ChunkCache {
    chunks: HashMap<ChunkKey, Arc<Chunk>>,
}

impl ChunkCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chunk: Arc<Chunk>) {
        self.chunks.insert(chunk.key(), chunk);
    }

    #[must_use]
    pub fn contains(&self, key: ChunkKey) -> bool {
        self.chunks.contains_key(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Handles for `keys`, in order.
    ///
    /// # Errors
    ///
    /// [`ServiceError::ProtocolViolation`] naming the first key the client
    /// never sent.
    pub fn resolve(&self, keys: &[ChunkKey]) -> Result<Vec<Arc<Chunk>>, ServiceError> {
        keys.iter()
            .map(|key| {
                self.chunks.get(key).map(Arc::clone).ok_or_else(|| {
                    ServiceError::ProtocolViolation(format!(
                        "Could not find sequence chunk {key}."
                    ))
                })
            })
            .collect()
    }

    /// Drop every chunk not listed in `keep`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::CacheInvariant`] when the cache does not end up
    /// holding exactly the distinct keys in `keep`.
    pub fn retain_only(&mut self, keep: &[ChunkKey]) -> Result<(), ServiceError> {
        let keep: HashSet<ChunkKey> = keep.iter().copied().collect();
        self.chunks.retain(|key, _| keep.contains(key));

        if self.chunks.len() != keep.len() {
            tracing::error!(
                kept = self.chunks.len(),
                expected = keep.len(),
                "insert stream chunk cache lost chunks the client asked to keep"
            );
            return Err(ServiceError::CacheInvariant(format!(
                "Kept less chunks than expected ({} of {}).",
                self.chunks.len(),
                keep.len()
            )));
        }
        Ok(())
    }
}

/// Drive one insert stream until the peer closes it or an error occurs.
///
/// Confirmations are written to `responses`; the caller turns the returned
/// error into the terminal status.
///
/// # Errors
///
/// The first [`ServiceError`] hit while processing a request.
pub async fn run_insert_stream<S>(
    registry: Arc<TableRegistry>,
    inbound: S,
    responses: mpsc::Sender<Result<InsertStreamResponse, Status>>,
) -> Result<(), ServiceError>
where
    S: Stream<Item = Result<InsertStreamRequest, Status>> + Send + Unpin + 'static,
{
    let mut queue = RequestQueue::spawn(inbound);
    let mut cache = ChunkCache::new();
    let mut committed = 0_u64;

    while let Some(request) = queue.pop().await {
        for data in request.chunks {
            if cache.contains(data.chunk_key) {
                continue;
            }
            let chunk = registry
                .chunk_store()
                .insert(data)
                .ok_or(ServiceError::Shutdown)?;
            cache.insert(chunk);
        }

        if let Some(entry) = request.item {
            commit_item(&registry, &mut cache, entry, &responses).await?;
            committed += 1;
        }
    }

    tracing::debug!(committed, "insert stream finished");
    Ok(())
}

async fn commit_item(
    registry: &TableRegistry,
    cache: &mut ChunkCache,
    entry: InsertItem,
    responses: &mpsc::Sender<Result<InsertStreamResponse, Status>>,
) -> Result<(), ServiceError> {
    let InsertItem {
        item,
        keep_chunk_keys,
        send_confirmation,
    } = entry;
    let item = item.ok_or_else(|| {
        ServiceError::ProtocolViolation("Insert request carried an empty item.".to_string())
    })?;

    let chunks = cache.resolve(&item.chunk_keys())?;
    let table = registry.table(&item.table)?;
    let key = item.key;
    table.insert_or_assign(TableItem::new(item, chunks))?;
    tracing::trace!(key, table = table.name(), "item committed");

    if send_confirmation {
        let response = InsertStreamResponse { keys: vec![key] };
        if responses.send(Ok(response)).await.is_err() {
            return Err(ServiceError::WriteFailed(format!(
                "Error when sending confirmation that item {key} has been successfully inserted/updated."
            )));
        }
    }

    cache.retain_only(&keep_chunk_keys)
}
