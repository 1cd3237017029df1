//! Tests for wire messages and trajectory helpers

use prost::Message;
use proptest::prelude::*;
use replay_proto::*;

fn slice(chunk_key: u64) -> ChunkSlice {
    ChunkSlice {
        chunk_key,
        offset: 0,
        length: 1,
        index: 0,
    }
}

#[test]
fn test_chunk_keys_follow_first_appearance_across_columns() {
    let trajectory = FlatTrajectory {
        columns: vec![
            flat_trajectory::Column {
                chunk_slices: vec![slice(5), slice(2)],
                squeeze: false,
            },
            flat_trajectory::Column {
                chunk_slices: vec![slice(2), slice(9), slice(5)],
                squeeze: true,
            },
        ],
    };

    assert_eq!(trajectory.chunk_keys(), vec![5, 2, 9]);
}

#[test]
fn test_chunk_keys_of_long_wide_trajectory() {
    let keys: Vec<u64> = (0..50_000).rev().collect();
    let column = || flat_trajectory::Column {
        chunk_slices: keys.iter().copied().map(slice).collect(),
        squeeze: false,
    };
    let trajectory = FlatTrajectory {
        columns: vec![column(), column(), column()],
    };

    assert_eq!(trajectory.chunk_keys(), keys);
}

#[test]
fn test_item_without_trajectory_has_no_chunk_keys() {
    let item = PrioritizedItem::new(1, "table", 1.0);
    assert!(item.chunk_keys().is_empty());
    assert!(item.inserted_at.is_some());
}

#[test]
fn test_chunk_payload_survives_encoding() {
    let chunk = ChunkData::new(11, b"trajectory bytes".to_vec());
    let request = InsertStreamRequest::with_item(
        vec![chunk.clone()],
        PrioritizedItem::new(1, "dist", 0.5).with_trajectory(FlatTrajectory::from_chunks(&[11], &[4])),
        vec![11],
        true,
    );

    let decoded = InsertStreamRequest::decode(request.encode_to_vec().as_slice()).unwrap();
    assert_eq!(decoded.chunks, vec![chunk]);
    let item = decoded.item.unwrap();
    assert!(item.send_confirmation);
    assert_eq!(item.keep_chunk_keys, vec![11]);
    assert_eq!(item.item.unwrap().chunk_keys(), vec![11]);
}

#[test]
fn test_sample_request_defaults_to_auto_batch_size() {
    let request = SampleStreamRequest::new("dist", 3);
    assert_eq!(request.flexible_batch_size, -1);
    assert!(request.rate_limiter_timeout.is_none());

    let request = request.with_flexible_batch_size(8).with_timeout_ms(250);
    assert_eq!(request.flexible_batch_size, 8);
    assert_eq!(request.rate_limiter_timeout.unwrap().milliseconds, 250);
}

proptest! {
    /// Property: extracted keys are distinct and cover every referenced key.
    #[test]
    fn chunk_keys_are_distinct_and_complete(
        columns in prop::collection::vec(prop::collection::vec(0u64..16, 0..8), 0..4)
    ) {
        let trajectory = FlatTrajectory {
            columns: columns
                .iter()
                .map(|keys| flat_trajectory::Column {
                    chunk_slices: keys.iter().copied().map(slice).collect(),
                    squeeze: false,
                })
                .collect(),
        };

        let keys = trajectory.chunk_keys();
        let mut deduped = keys.clone();
        deduped.sort_unstable();
        deduped.dedup();
        prop_assert_eq!(deduped.len(), keys.len());

        for key in columns.iter().flatten() {
            prop_assert!(keys.contains(key));
        }
    }

    /// Property: the 128-bit state id survives the wire split.
    #[test]
    fn uint128_split_is_lossless(value in any::<u128>()) {
        prop_assert_eq!(Uint128::from_u128(value).to_u128(), value);
    }
}
