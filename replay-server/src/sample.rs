//! Sample stream pipeline.
//!
//! Each request is served by drawing flexible batches from the table on the
//! blocking pool, then packing every sampled item into one or more response
//! messages. Chunk payloads are attached by reference: the `Bytes` buffers
//! held by the table item are shared with the outgoing message, never copied.

use replay_core::{AUTO_SELECT_FLEXIBLE_BATCH_SIZE, ReplayError, SampledItem, Table};
use replay_proto::{SampleEntry, SampleInfo, SampleStreamRequest, SampleStreamResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::error::ServiceError;
use crate::registry::TableRegistry;

/// Soft upper bound on the encoded size of one sample response.
///
/// A message only exceeds it when a single chunk is larger than the budget.
pub const MAX_SAMPLE_RESPONSE_SIZE_BYTES: usize = 40 * 1024 * 1024;

/// Field number of `SampleStreamResponse.entries`.
const ENTRIES_FIELD: u32 = 1;

/// Drive one sample stream until the peer closes it, the stream is
/// cancelled, or an error occurs.
///
/// # Errors
///
/// Invalid requests, unknown tables, sampling failures and failed writes.
/// Cancellation is not an error.
pub async fn run_sample_stream<S>(
    registry: Arc<TableRegistry>,
    mut inbound: S,
    responses: mpsc::Sender<Result<SampleStreamResponse, Status>>,
    cancel: CancellationToken,
    max_response_bytes: usize,
) -> Result<(), ServiceError>
where
    S: Stream<Item = Result<SampleStreamRequest, Status>> + Send + Unpin,
{
    let Some(mut request) = next_request(&mut inbound, &cancel).await else {
        if cancel.is_cancelled() {
            return Ok(());
        }
        return Err(ServiceError::ProtocolViolation(
            "Could not read initial request".to_string(),
        ));
    };

    // The first request fixes the rate limiter timeout for the whole stream.
    let timeout = request
        .rate_limiter_timeout
        .as_ref()
        .and_then(|timeout| u64::try_from(timeout.milliseconds).ok())
        .map(Duration::from_millis);
    tracing::debug!(table = %request.table, ?timeout, "sample stream opened");

    let stream = SampleStream {
        registry,
        responses,
        cancel,
        timeout,
        max_response_bytes,
    };

    loop {
        stream.serve(&request).await?;
        if stream.cancel.is_cancelled() {
            break;
        }
        match next_request(&mut inbound, &stream.cancel).await {
            Some(next) => request = next,
            None => break,
        }
    }

    tracing::debug!("sample stream finished");
    Ok(())
}

async fn next_request<S>(inbound: &mut S, cancel: &CancellationToken) -> Option<SampleStreamRequest>
where
    S: Stream<Item = Result<SampleStreamRequest, Status>> + Unpin,
{
    tokio::select! {
        () = cancel.cancelled() => None,
        next = inbound.next() => match next {
            Some(Ok(request)) => Some(request),
            Some(Err(status)) => {
                tracing::debug!(error = %status, "Failed to read from stream");
                None
            }
            None => None,
        },
    }
}

struct SampleStream {
    registry: Arc<TableRegistry>,
    responses: mpsc::Sender<Result<SampleStreamResponse, Status>>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    max_response_bytes: usize,
}

impl SampleStream {
    async fn serve(&self, request: &SampleStreamRequest) -> Result<(), ServiceError> {
        validate(request)?;
        let table = self.registry.table(&request.table)?;

        let batch_size = if request.flexible_batch_size == AUTO_SELECT_FLEXIBLE_BATCH_SIZE {
            table.default_flexible_batch_size()
        } else {
            usize::try_from(request.flexible_batch_size).unwrap_or(1)
        }
        .max(1);
        let mut remaining = usize::try_from(request.num_samples).unwrap_or(usize::MAX);

        while remaining > 0 {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let max_batch_size = batch_size.min(remaining);
            let Some(mut samples) = self.sample_batch(&table, max_batch_size).await? else {
                return Ok(());
            };
            if samples.is_empty() {
                return Err(ReplayError::Internal(format!(
                    "Table {} returned an empty batch.",
                    table.name()
                ))
                .into());
            }
            samples.truncate(max_batch_size);
            remaining -= samples.len();

            for sample in &samples {
                for message in pack_sample(sample, self.max_response_bytes) {
                    self.write(message).await?;
                }
            }
        }
        Ok(())
    }

    /// Returns `None` when the stream was cancelled while sampling.
    ///
    /// The blocking sampler shares the stream's token and gives up without
    /// drawing once it fires; it is always joined before returning.
    async fn sample_batch(
        &self,
        table: &Arc<dyn Table>,
        max_batch_size: usize,
    ) -> Result<Option<Vec<SampledItem>>, ServiceError> {
        let table = Arc::clone(table);
        let timeout = self.timeout;
        let cancel = self.cancel.clone();
        let mut sampling = tokio::task::spawn_blocking(move || {
            table.sample_flexible_batch(max_batch_size, timeout, &cancel)
        });

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            () = self.responses.closed() => self.cancel.cancel(),
            joined = &mut sampling => {
                let samples = joined.map_err(|err| {
                    ReplayError::Internal(format!("Sampling task failed: {err}"))
                })??;
                return Ok(Some(samples));
            }
        }

        // A batch drawn in the same instant the token fired is dropped here.
        if let Ok(Err(err)) = sampling.await {
            tracing::trace!(error = %err, "sampler stopped after cancellation");
        }
        Ok(None)
    }

    async fn write(&self, message: SampleStreamResponse) -> Result<(), ServiceError> {
        self.responses
            .send(Ok(message))
            .await
            .map_err(|_| ServiceError::WriteFailed("Failed to write to Sample stream.".to_string()))
    }
}

fn validate(request: &SampleStreamRequest) -> Result<(), ServiceError> {
    if request.num_samples <= 0 {
        return Err(ServiceError::InvalidArgument(
            "`num_samples` must be > 0.".to_string(),
        ));
    }
    if request.flexible_batch_size <= 0
        && request.flexible_batch_size != AUTO_SELECT_FLEXIBLE_BATCH_SIZE
    {
        return Err(ServiceError::InvalidArgument(
            "`flexible_batch_size` must be > 0 or -1 (for auto tuning).".to_string(),
        ));
    }
    Ok(())
}

fn response_len(entry: &SampleEntry) -> usize {
    prost::encoding::message::encoded_len(ENTRIES_FIELD, entry)
}

/// Split one sampled item into response messages.
///
/// Every message holds a single entry. The first entry carries the item
/// metadata with priority and times-sampled taken from the sample, and the
/// entry holding the last chunk is flagged end-of-sequence. A new message is
/// started whenever adding a chunk would push the encoded size past
/// `max_response_bytes`.
#[must_use]
pub fn pack_sample(sample: &SampledItem, max_response_bytes: usize) -> Vec<SampleStreamResponse> {
    let mut item = sample.item.item.clone();
    item.priority = sample.priority;
    item.times_sampled = sample.times_sampled;
    let info = SampleInfo {
        item: Some(item),
        probability: sample.probability,
        table_size: sample.table_size,
        rate_limited: sample.rate_limited,
    };

    let mut messages = Vec::new();
    let mut flush = |entry: SampleEntry| {
        messages.push(SampleStreamResponse {
            entries: vec![entry],
        });
    };

    let mut entry = SampleEntry {
        data: Vec::new(),
        info: Some(info),
        end_of_sequence: false,
    };

    let chunks = &sample.item.chunks;
    if chunks.is_empty() {
        entry.end_of_sequence = true;
        flush(entry);
        return messages;
    }

    let last = chunks.len() - 1;
    for (index, chunk) in chunks.iter().enumerate() {
        let is_last = index == last;
        entry.data.push(chunk.data().clone());
        entry.end_of_sequence = is_last;

        if entry.data.len() > 1 && response_len(&entry) > max_response_bytes {
            if let Some(overflow) = entry.data.pop() {
                let mut full = std::mem::take(&mut entry);
                full.end_of_sequence = false;
                flush(full);
                entry.data.push(overflow);
                entry.end_of_sequence = is_last;
            }
        }

        if is_last {
            flush(std::mem::take(&mut entry));
        } else if response_len(&entry) >= max_response_bytes {
            flush(std::mem::take(&mut entry));
        }
    }
    messages
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use prost::Message;
    use replay_core::{ChunkStore, TableItem};
    use replay_proto::{ChunkData, FlatTrajectory, PrioritizedItem};

    fn sampled(store: &ChunkStore, payload_sizes: &[usize]) -> SampledItem {
        let keys: Vec<u64> = (1..=payload_sizes.len() as u64).collect();
        let chunks = keys
            .iter()
            .zip(payload_sizes)
            .map(|(&key, &size)| store.insert(ChunkData::new(key, vec![7_u8; size])).unwrap())
            .collect();
        let lengths = vec![1; keys.len()];
        let item = PrioritizedItem::new(42, "t", 1.0)
            .with_trajectory(FlatTrajectory::from_chunks(&keys, &lengths));
        SampledItem {
            item: Arc::new(TableItem::new(item, chunks)),
            priority: 3.5,
            times_sampled: 2,
            probability: 0.25,
            table_size: 10,
            rate_limited: false,
        }
    }

    #[test]
    fn test_small_item_fits_one_message() {
        let store = ChunkStore::new();
        let messages = pack_sample(&sampled(&store, &[8, 8, 8]), MAX_SAMPLE_RESPONSE_SIZE_BYTES);

        assert_eq!(messages.len(), 1);
        let entry = &messages[0].entries[0];
        assert_eq!(entry.data.len(), 3);
        assert!(entry.end_of_sequence);
        let info = entry.info.as_ref().unwrap();
        let item = info.item.as_ref().unwrap();
        assert_eq!(item.priority, 3.5);
        assert_eq!(item.times_sampled, 2);
        assert_eq!(info.probability, 0.25);
    }

    #[test]
    fn test_budget_splits_messages_in_chunk_order() {
        let store = ChunkStore::new();
        let messages = pack_sample(&sampled(&store, &[100, 100, 100, 100]), 150);

        assert_eq!(messages.len(), 4);
        let keys: Vec<u64> = messages
            .iter()
            .flat_map(|m| m.entries[0].data.iter().map(|c| c.chunk_key))
            .collect();
        assert_eq!(keys, vec![1, 2, 3, 4]);

        assert!(messages[0].entries[0].info.is_some());
        assert!(messages[1..].iter().all(|m| m.entries[0].info.is_none()));
        let flags: Vec<bool> = messages.iter().map(|m| m.entries[0].end_of_sequence).collect();
        assert_eq!(flags, vec![false, false, false, true]);
    }

    #[test]
    fn test_multi_chunk_messages_respect_budget() {
        let store = ChunkStore::new();
        let budget = 300;
        let messages = pack_sample(&sampled(&store, &[60; 12]), budget);

        assert!(messages.len() > 1);
        for message in &messages {
            assert_eq!(message.entries.len(), 1);
            if message.entries[0].data.len() > 1 {
                assert!(message.encoded_len() <= budget);
            }
        }
    }

    #[test]
    fn test_oversized_chunk_is_sent_alone() {
        let store = ChunkStore::new();
        let messages = pack_sample(&sampled(&store, &[10, 500, 10]), 100);

        let sizes: Vec<usize> = messages.iter().map(|m| m.entries[0].data.len()).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
        assert!(messages[2].entries[0].end_of_sequence);
    }

    #[test]
    fn test_payload_is_shared_not_copied() {
        let store = ChunkStore::new();
        let sample = sampled(&store, &[32]);
        let messages = pack_sample(&sample, MAX_SAMPLE_RESPONSE_SIZE_BYTES);

        let sent = &messages[0].entries[0].data[0].data;
        let held = sample.item.chunks[0].payload();
        assert_eq!(sent.as_ptr(), held.as_ptr());
    }

    #[test]
    fn test_item_without_chunks_sends_metadata_only() {
        let store = ChunkStore::new();
        let messages = pack_sample(&sampled(&store, &[]), MAX_SAMPLE_RESPONSE_SIZE_BYTES);

        assert_eq!(messages.len(), 1);
        assert!(messages[0].entries[0].data.is_empty());
        assert!(messages[0].entries[0].end_of_sequence);
        assert!(messages[0].entries[0].info.is_some());
    }

    #[test]
    fn test_validate_messages() {
        let err = validate(&SampleStreamRequest::new("t", 0)).unwrap_err();
        assert_eq!(err.to_string(), "`num_samples` must be > 0.");

        let err = validate(&SampleStreamRequest::new("t", 1).with_flexible_batch_size(0))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "`flexible_batch_size` must be > 0 or -1 (for auto tuning)."
        );

        assert!(validate(&SampleStreamRequest::new("t", 1)).is_ok());
    }
}
