//! Save/load round-trips, the legacy format path, and version gating.

use proxima::{
    Index, IndexOptions, LoadOverrides, MemoryInputStream, MemoryOutputStream, ProximaError,
    ReaderInputStream, Space, StorageDataType,
};

fn sample_vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            (0..dim)
                .map(|j| (((i * 31 + j * 7) % 17) as f32 - 8.0) / 10.0)
                .collect()
        })
        .collect()
}

fn build(space: Space, storage: StorageDataType, n: usize, dim: usize) -> Index {
    let options = IndexOptions { storage, ..Default::default() };
    let index = Index::new(space, dim, options);
    index.add_items(&sample_vectors(n, dim), None, 1).unwrap();
    index
}

fn save_to_bytes(index: &Index) -> Vec<u8> {
    let mut out = MemoryOutputStream::new();
    index.save(&mut out).unwrap();
    out.into_bytes()
}

#[test]
fn round_trip_preserves_query_results_for_every_space_and_storage() {
    let spaces = [Space::Euclidean, Space::InnerProduct, Space::Cosine];
    let storages =
        [StorageDataType::Float32, StorageDataType::Float8, StorageDataType::E4M3];
    let queries = sample_vectors(10, 8);

    for space in spaces {
        for storage in storages {
            let index = build(space, storage, 60, 8);
            let bytes = save_to_bytes(&index);

            let mut input = MemoryInputStream::new(bytes);
            let loaded = Index::load(&mut input, None).unwrap();

            assert_eq!(loaded.space(), space);
            assert_eq!(loaded.storage(), storage);
            assert_eq!(loaded.num_dimensions(), 8);
            assert_eq!(loaded.num_elements(), index.num_elements());

            for query in &queries {
                let original = index.query(query, 5, Some(30)).unwrap();
                let reloaded = loaded.query(query, 5, Some(30)).unwrap();
                assert_eq!(original, reloaded, "{space}/{storage} diverged after reload");
            }
        }
    }
}

#[test]
fn round_trip_through_a_file_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.hnsw");

    let index = build(Space::Euclidean, StorageDataType::Float32, 40, 4);
    index.save_to_file(&path).unwrap();

    let loaded = Index::load_from_file(&path, None).unwrap();
    let query = vec![0.1, -0.2, 0.3, 0.0];
    assert_eq!(
        index.query(&query, 3, None).unwrap(),
        loaded.query(&query, 3, None).unwrap()
    );
}

#[test]
fn round_trip_preserves_deletions_and_label_counter() {
    let index = build(Space::Euclidean, StorageDataType::Float32, 20, 4);
    index.mark_deleted(7).unwrap();
    index.mark_deleted(13).unwrap();

    let mut input = MemoryInputStream::new(save_to_bytes(&index));
    let loaded = Index::load(&mut input, None).unwrap();

    assert_eq!(loaded.num_elements(), 18);
    assert!(!loaded.contains(7));
    assert!(loaded.contains(8));

    // The default-label counter restarts at the occupied count.
    assert_eq!(loaded.add_item(&[0.0; 4], None).unwrap(), 20);
}

#[test]
fn round_trip_preserves_max_norm() {
    let options =
        IndexOptions { use_order_preserving_transform: true, ..Default::default() };
    let index = Index::new(Space::InnerProduct, 2, options);
    index.add_item(&[3.0, 4.0], Some(1)).unwrap();
    index.add_item(&[1.0, 0.0], Some(2)).unwrap();

    let mut input = MemoryInputStream::new(save_to_bytes(&index));
    let loaded = Index::load(&mut input, None).unwrap();
    assert!((loaded.max_norm() - 5.0).abs() < 1e-6);

    let (labels, distances) = loaded.query(&[1.0, 0.0], 1, None).unwrap();
    assert_eq!(labels, vec![1]);
    assert!((distances[0] - -2.0).abs() < 1e-5);
}

#[test]
fn loading_from_a_non_seekable_reader_works() {
    let index = build(Space::Cosine, StorageDataType::Float32, 30, 4);
    let bytes = save_to_bytes(&index);

    let mut stream = ReaderInputStream::new(std::io::Cursor::new(bytes));
    let loaded = Index::load(&mut stream, None).unwrap();
    assert_eq!(loaded.num_elements(), 30);
}

#[test]
fn version_99_is_rejected_with_hex_rendering() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"VOYA");
    bytes.extend_from_slice(&99i32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 64]);

    let mut input = MemoryInputStream::new(bytes);
    let err = Index::load(&mut input, None).unwrap_err();
    match &err {
        ProximaError::UnsupportedVersion(version) => assert_eq!(*version, 99),
        other => panic!("expected UnsupportedVersion, got {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("0x63"), "missing hex version in: {message}");
}

#[test]
fn legacy_payload_loads_with_explicit_shape() {
    let index = build(Space::Euclidean, StorageDataType::Float32, 25, 4);
    let bytes = save_to_bytes(&index);

    // A legacy file is exactly the graph payload with no metadata header.
    let legacy = bytes[19..].to_vec();
    let overrides = LoadOverrides {
        space: Space::Euclidean,
        num_dimensions: 4,
        storage: StorageDataType::Float32,
    };
    let mut input = MemoryInputStream::new(legacy);
    let loaded = Index::load(&mut input, Some(overrides)).unwrap();

    assert_eq!(loaded.num_elements(), 25);
    let query = vec![0.3, 0.1, -0.4, 0.0];
    assert_eq!(
        index.query(&query, 3, None).unwrap(),
        loaded.query(&query, 3, None).unwrap()
    );
}

#[test]
fn legacy_payload_without_overrides_is_rejected() {
    let index = build(Space::Euclidean, StorageDataType::Float32, 10, 4);
    let legacy = save_to_bytes(&index)[19..].to_vec();

    let mut input = MemoryInputStream::new(legacy);
    let err = Index::load(&mut input, None).unwrap_err();
    assert!(matches!(err, ProximaError::Corrupt(_)), "got {err:?}");
}

#[test]
fn inconsistent_legacy_garbage_is_corrupt() {
    let garbage = vec![0xABu8; 200];
    let overrides = LoadOverrides {
        space: Space::Euclidean,
        num_dimensions: 4,
        storage: StorageDataType::Float32,
    };
    let mut input = MemoryInputStream::new(garbage);
    let err = Index::load(&mut input, Some(overrides)).unwrap_err();
    assert!(matches!(err, ProximaError::Corrupt(_)), "got {err:?}");
}

#[test]
fn metadata_overrides_must_match_the_file() {
    let index = build(Space::Euclidean, StorageDataType::Float32, 10, 4);
    let bytes = save_to_bytes(&index);

    let overrides = LoadOverrides {
        space: Space::Cosine,
        num_dimensions: 4,
        storage: StorageDataType::Float32,
    };
    let mut input = MemoryInputStream::new(bytes);
    let err = Index::load(&mut input, Some(overrides)).unwrap_err();
    assert!(matches!(err, ProximaError::Corrupt(_)), "got {err:?}");
}

#[test]
fn truncated_file_is_corrupt_not_a_panic() {
    let index = build(Space::Euclidean, StorageDataType::Float32, 20, 4);
    let bytes = save_to_bytes(&index);

    for keep in [5, 19, 40, bytes.len() - 3] {
        let mut input = MemoryInputStream::new(bytes[..keep].to_vec());
        let err = Index::load(&mut input, None).unwrap_err();
        assert!(
            matches!(err, ProximaError::Corrupt(_)),
            "truncation to {keep} bytes gave {err:?}"
        );
    }
}

#[test]
fn header_prefix_is_stable() {
    let index = build(Space::InnerProduct, StorageDataType::E4M3, 5, 3);
    let bytes = save_to_bytes(&index);

    assert_eq!(&bytes[0..4], b"VOYA");
    assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
    assert_eq!(i32::from_le_bytes(bytes[8..12].try_into().unwrap()), 3);
    assert_eq!(bytes[12], 1); // InnerProduct
    assert_eq!(bytes[13], 0x30); // E4M3
    assert_eq!(bytes[18], 0); // transform flag off
}
