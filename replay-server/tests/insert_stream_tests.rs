//! Insert stream behaviour: chunk caching, item commit, confirmations and
//! the errors that end a stream.

#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use replay_core::{InMemoryTable, Table, TableConfig};
use replay_proto::{
    ChunkData, FlatTrajectory, InsertStreamRequest, InsertStreamResponse, PrioritizedItem,
    ServerInfoRequest,
};
use replay_server::{ReplayService, ServiceOptions};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tonic::{Code, Status};

fn service_with(tables: &[&str]) -> ReplayService {
    let tables = tables
        .iter()
        .map(|name| Arc::new(InMemoryTable::new(TableConfig::named(*name))) as Arc<dyn Table>)
        .collect();
    ReplayService::create(tables, None, ServiceOptions::default()).expect("service")
}

fn chunk(key: u64) -> ChunkData {
    ChunkData::new(key, Bytes::from(format!("chunk-{key}")))
}

fn item(key: u64, table: &str, chunk_keys: &[u64]) -> PrioritizedItem {
    let lengths = vec![1; chunk_keys.len()];
    PrioritizedItem::new(key, table, 1.0)
        .with_trajectory(FlatTrajectory::from_chunks(chunk_keys, &lengths))
}

async fn run(
    service: &ReplayService,
    requests: Vec<InsertStreamRequest>,
) -> Vec<Result<InsertStreamResponse, Status>> {
    let inbound = tokio_stream::iter(requests.into_iter().map(Ok));
    service.insert_stream(inbound).collect().await
}

async fn table_size(service: &ReplayService, table: &str) -> i64 {
    let info = service.server_info(ServerInfoRequest {}).await.unwrap();
    info.table_info
        .iter()
        .find(|info| info.name == table)
        .map(|info| info.current_size)
        .unwrap()
}

#[tokio::test]
async fn test_item_is_committed_and_confirmed() {
    let service = service_with(&["t"]);

    let responses = run(
        &service,
        vec![InsertStreamRequest::with_item(
            vec![chunk(1)],
            item(10, "t", &[1]),
            vec![],
            true,
        )],
    )
    .await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].as_ref().unwrap().keys, vec![10]);
    assert_eq!(table_size(&service, "t").await, 1);
}

#[tokio::test]
async fn test_no_confirmation_unless_requested() {
    let service = service_with(&["t"]);

    let responses = run(
        &service,
        vec![InsertStreamRequest::with_item(
            vec![chunk(1)],
            item(10, "t", &[1]),
            vec![],
            false,
        )],
    )
    .await;

    assert!(responses.is_empty());
    assert_eq!(table_size(&service, "t").await, 1);
}

#[tokio::test]
async fn test_kept_chunks_are_reused_by_later_items() {
    let service = service_with(&["t"]);

    let responses = run(
        &service,
        vec![
            InsertStreamRequest::with_chunks(vec![chunk(1)]),
            InsertStreamRequest::with_item(vec![chunk(2)], item(10, "t", &[1, 2]), vec![2], true),
            InsertStreamRequest::with_item(vec![chunk(3)], item(11, "t", &[2, 3]), vec![], true),
        ],
    )
    .await;

    let keys: Vec<u64> = responses
        .into_iter()
        .flat_map(|response| response.unwrap().keys)
        .collect();
    assert_eq!(keys, vec![10, 11]);
    assert_eq!(table_size(&service, "t").await, 2);

    // Only the table items keep chunks alive once the stream is gone.
    assert_eq!(service.registry().chunk_store().live_chunks(), 3);
    service.registry().reset("t").unwrap();
    assert_eq!(service.registry().chunk_store().live_chunks(), 0);
}

#[tokio::test]
async fn test_duplicate_chunk_across_streams_is_shared() {
    let service = service_with(&["t"]);

    for key in [10, 11] {
        let responses = run(
            &service,
            vec![InsertStreamRequest::with_item(
                vec![chunk(1)],
                item(key, "t", &[1]),
                vec![],
                false,
            )],
        )
        .await;
        assert!(responses.is_empty());
    }

    assert_eq!(service.registry().chunk_store().live_chunks(), 1);
}

#[tokio::test]
async fn test_unknown_table_fails_without_confirmation() {
    let service = service_with(&["t"]);

    let responses = run(
        &service,
        vec![InsertStreamRequest::with_item(
            vec![chunk(1)],
            item(10, "missing", &[1]),
            vec![],
            true,
        )],
    )
    .await;

    assert_eq!(responses.len(), 1);
    let status = responses[0].as_ref().unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.message(), "Priority table missing was not found");
    assert_eq!(table_size(&service, "t").await, 0);
}

#[tokio::test]
async fn test_unsent_chunk_is_internal_and_nothing_committed() {
    let service = service_with(&["t"]);

    let responses = run(
        &service,
        vec![InsertStreamRequest::with_item(
            vec![chunk(1)],
            item(10, "t", &[1, 5]),
            vec![],
            true,
        )],
    )
    .await;

    assert_eq!(responses.len(), 1);
    let status = responses[0].as_ref().unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "Could not find sequence chunk 5.");
    assert_eq!(table_size(&service, "t").await, 0);
}

#[tokio::test]
async fn test_released_chunk_cannot_be_referenced_again() {
    let service = service_with(&["t"]);

    let responses = run(
        &service,
        vec![
            InsertStreamRequest::with_item(vec![chunk(1)], item(10, "t", &[1]), vec![], true),
            InsertStreamRequest::with_item(vec![], item(11, "t", &[1]), vec![], true),
        ],
    )
    .await;

    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].as_ref().unwrap().keys, vec![10]);
    assert_eq!(responses[1].as_ref().unwrap_err().code(), Code::Internal);
}

#[tokio::test]
async fn test_keep_list_naming_unknown_chunk_is_internal() {
    let service = service_with(&["t"]);

    let responses = run(
        &service,
        vec![InsertStreamRequest::with_item(
            vec![chunk(1)],
            item(10, "t", &[1]),
            vec![1, 99],
            false,
        )],
    )
    .await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].as_ref().unwrap_err().code(), Code::Internal);
}

#[tokio::test]
async fn test_invalid_priority_is_passed_through() {
    let service = service_with(&["t"]);
    let mut bad = item(10, "t", &[1]);
    bad.priority = -1.0;

    let responses = run(
        &service,
        vec![InsertStreamRequest::with_item(vec![chunk(1)], bad, vec![], true)],
    )
    .await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].as_ref().unwrap_err().code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_closed_service_cancels_insert() {
    let service = service_with(&["t"]);
    service.close();

    let responses = run(&service, vec![InsertStreamRequest::with_chunks(vec![chunk(1)])]).await;

    assert_eq!(responses.len(), 1);
    let status = responses[0].as_ref().unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);
    assert_eq!(status.message(), "Service has been closed");
}

#[tokio::test]
async fn test_read_error_ends_stream_cleanly() {
    let service = service_with(&["t"]);
    let inbound = tokio_stream::iter(vec![
        Ok(InsertStreamRequest::with_item(
            vec![chunk(1)],
            item(10, "t", &[1]),
            vec![],
            true,
        )),
        Err(Status::unavailable("connection reset")),
        Ok(InsertStreamRequest::with_item(
            vec![chunk(2)],
            item(11, "t", &[2]),
            vec![],
            true,
        )),
    ]);

    let responses: Vec<_> = service.insert_stream(inbound).collect().await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].as_ref().unwrap().keys, vec![10]);
    assert_eq!(table_size(&service, "t").await, 1);
}
