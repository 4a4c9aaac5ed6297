mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use dog_filestore::{
    ChunkOutcome, FileBackend, FileStoreError, FileSystemBackend, InMemoryBackend,
    MemoryTransferRecordStore, StoreConfig, TransferManager, TransferState,
};

use common::{payload, FailingReads};

fn manager_over(backend: Arc<dyn FileBackend>, chunk_size: u64) -> TransferManager {
    TransferManager::new(
        backend,
        Arc::new(MemoryTransferRecordStore::new()),
        &StoreConfig::default().with_chunk_size(chunk_size),
    )
}

fn chunk_of(data: &[u8], chunk_number: u32, chunk_size: usize) -> Vec<u8> {
    let start = (chunk_number as usize - 1) * chunk_size;
    let end = (start + chunk_size).min(data.len());
    data[start..end].to_vec()
}

/// T1. 1000 bytes in 50 chunks: partial progress, then completion
#[tokio::test]
async fn test_thousand_byte_transfer_in_fifty_chunks() {
    let backend = Arc::new(InMemoryBackend::with_read_quantum(64));
    let manager = manager_over(backend.clone(), 20);
    let data = payload(1000);

    // Arrange
    let record = manager.incoming("report", 1000, None).await.unwrap();
    assert_eq!(record.total_chunks, 50);

    // Act: first two chunks
    for n in [1, 2] {
        manager.put_chunk("report", n, chunk_of(&data, n, 20)).await.unwrap();
    }

    // Assert: 40 bytes in, not complete
    let progress = manager.progress("report").await.unwrap();
    assert_eq!(progress.bytes_received, 40);
    assert_eq!(progress.percent, 4);
    assert_eq!(manager.state("report").await.unwrap(), TransferState::InProgress);
    assert_eq!(manager.start_chunk("report").await.unwrap(), Some(3));

    // Act: the rest, in reverse
    let mut completions = 0;
    for n in (3..=50).rev() {
        let outcome = manager.put_chunk("report", n, chunk_of(&data, n, 20)).await.unwrap();
        if outcome.is_complete() {
            completions += 1;
            assert_eq!(n, 3, "only the last new chunk completes the transfer");
        }
    }

    // Assert
    assert_eq!(completions, 1);
    assert_eq!(manager.state("report").await.unwrap(), TransferState::Complete);
    assert_eq!(manager.start_chunk("report").await.unwrap(), None);
    let stored = backend.get("report").await.unwrap();
    assert_eq!(stored.len(), 1000);
    assert_eq!(stored, Bytes::from(data));
    assert_eq!(backend.len(), 1, "chunk objects are removed after assembly");
}

/// T2. Re-delivered chunks overwrite bytes without double counting
#[tokio::test]
async fn test_resubmitted_chunk_is_not_double_counted() {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = manager_over(backend.clone(), 20);
    manager.incoming("doc", 60, None).await.unwrap();

    manager.put_chunk("doc", 2, vec![b'x'; 20]).await.unwrap();
    let outcome = manager.put_chunk("doc", 2, vec![b'y'; 20]).await.unwrap();

    assert_eq!(
        outcome,
        ChunkOutcome::InProgress {
            chunks_received: 1,
            total_chunks: 3,
            bytes_received: 20
        }
    );
    assert_eq!(backend.get_chunk("doc", 2).await.unwrap(), Bytes::from(vec![b'y'; 20]));
}

/// T3. Concurrent last chunks: exactly one submitter observes completion
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_concurrent_submitter_completes() {
    let backend = Arc::new(InMemoryBackend::with_read_quantum(16));
    let manager = Arc::new(manager_over(backend.clone(), 10));
    let data = payload(200);
    manager.incoming("race", 200, None).await.unwrap();

    // Arrange: everything but the last eight chunks
    for n in 1..=12 {
        manager.put_chunk("race", n, chunk_of(&data, n, 10)).await.unwrap();
    }

    // Act: submit the remaining chunks at once
    let handles: Vec<_> = (13..=20)
        .map(|n| {
            let manager = manager.clone();
            let chunk = chunk_of(&data, n, 10);
            tokio::spawn(async move { manager.put_chunk("race", n, chunk).await })
        })
        .collect();

    let mut completed = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_complete() {
            completed += 1;
        }
    }

    // Assert
    assert_eq!(completed, 1);
    assert_eq!(backend.get("race").await.unwrap(), Bytes::from(data));
    let record = manager.record("race").await.unwrap();
    assert_eq!(record.bytes_received, 200);
    assert!(record.content_hash.is_some());
}

/// T4. Size mismatch rolls back and leaves nothing in the backend
#[tokio::test]
async fn test_size_mismatch_rolls_back_to_empty() {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = manager_over(backend.clone(), 20);
    manager.incoming("short", 40, None).await.unwrap();

    manager.put_chunk("short", 1, vec![1u8; 20]).await.unwrap();
    let err = manager.put_chunk("short", 2, vec![2u8; 15]).await.unwrap_err();

    assert!(matches!(err, FileStoreError::SizeMismatch { expected: 40, actual: 35 }));
    let record = manager.record("short").await.unwrap();
    assert_eq!(record.state(), TransferState::Empty);
    assert!(record.chunks_received.is_empty());
    assert_eq!(record.bytes_received, 0);
    assert!(backend.is_empty(), "left behind: {:?}", backend.locators());

    // Retransmission from scratch succeeds
    manager.put_chunk("short", 1, vec![1u8; 20]).await.unwrap();
    assert!(manager.put_chunk("short", 2, vec![2u8; 20]).await.unwrap().is_complete());
}

/// T5. An I/O failure while reading chunks also rolls back
#[tokio::test]
async fn test_io_failure_during_assembly_rolls_back() {
    let backend = Arc::new(FailingReads {
        inner: InMemoryBackend::new(),
        poisoned: "chunk_doc_2".to_string(),
    });
    let manager = manager_over(backend.clone(), 5);
    manager.incoming("doc", 10, None).await.unwrap();

    manager.put_chunk("doc", 1, "hello").await.unwrap();
    let err = manager.put_chunk("doc", 2, "world").await.unwrap_err();

    assert!(matches!(err, FileStoreError::Io { .. }));
    assert_eq!(manager.state("doc").await.unwrap(), TransferState::Empty);
    assert!(backend.inner.is_empty());
}

/// T6. Chunked transfers work on disk too
#[tokio::test]
async fn test_file_system_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileSystemBackend::new(dir.path(), 32).await.unwrap());
    let manager = manager_over(backend.clone(), 100);
    let data = payload(450);

    manager.incoming("disk_doc", 450, None).await.unwrap();
    for n in [5, 1, 4, 2, 3] {
        manager.put_chunk("disk_doc", n, chunk_of(&data, n, 100)).await.unwrap();
    }

    assert_eq!(manager.get_contents("disk_doc").await.unwrap(), Some(Bytes::from(data)));
    let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(files.len(), 1);
}

/// T7. Declaring the same transfer twice keeps the first declaration
#[tokio::test]
async fn test_incoming_is_idempotent() {
    let manager = manager_over(Arc::new(InMemoryBackend::new()), 20);
    manager.incoming("doc", 100, None).await.unwrap();
    manager.put_chunk("doc", 1, vec![0u8; 20]).await.unwrap();

    let again = manager.incoming("doc", 100, None).await.unwrap();
    assert_eq!(again.bytes_received, 20);
}

/// T9. Re-deliveries racing the completing chunk leave no chunk objects
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redeliveries_racing_completion_leave_no_chunks() {
    let backend = Arc::new(InMemoryBackend::with_read_quantum(16));
    let manager = Arc::new(manager_over(backend.clone(), 10));
    let data = payload(200);
    manager.incoming("race", 200, None).await.unwrap();
    for n in 1..=19 {
        manager.put_chunk("race", n, chunk_of(&data, n, 10)).await.unwrap();
    }

    // Act: the last chunk alongside re-deliveries of everything before it
    let handles: Vec<_> = (1..=20)
        .rev()
        .map(|n| {
            let manager = manager.clone();
            let chunk = chunk_of(&data, n, 10);
            tokio::spawn(async move { manager.put_chunk("race", n, chunk).await })
        })
        .collect();

    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) if outcome.is_complete() => completed += 1,
            Ok(_) | Err(FileStoreError::TransferAlreadyComplete { .. }) => {}
            Err(e) => panic!("unexpected failure: {}", e),
        }
    }

    // Assert
    assert_eq!(completed, 1);
    assert_eq!(backend.get("race").await.unwrap(), Bytes::from(data));
    assert_eq!(backend.locators(), vec!["race".to_string()]);
    assert!(manager.record("race").await.unwrap().late_chunks.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// T8. Any submission order assembles the ascending concatenation
    #[test]
    fn prop_any_order_assembles_in_chunk_order(
        order in (1u32..=12).prop_flat_map(|n| Just((1..=n).collect::<Vec<u32>>()).prop_shuffle()),
        tail in 1usize..=7,
    ) {
        let total = order.len() as u32;
        let chunk_size = 7usize;
        let size = (total as usize - 1) * chunk_size + tail;
        let data = payload(size);

        let (stored, received) = tokio_test::block_on(async {
            let backend = Arc::new(InMemoryBackend::with_read_quantum(5));
            let manager = manager_over(backend.clone(), chunk_size as u64);
            manager.incoming("prop", size as u64, None).await.unwrap();

            let mut completions = 0;
            for n in &order {
                if manager.put_chunk("prop", *n, chunk_of(&data, *n, chunk_size)).await.unwrap().is_complete() {
                    completions += 1;
                }
            }
            assert_eq!(completions, 1);
            let record = manager.record("prop").await.unwrap();
            (backend.get("prop").await.unwrap(), record.chunks_received)
        });

        prop_assert_eq!(stored, Bytes::from(data));
        prop_assert_eq!(received, (1..=total).collect::<BTreeSet<u32>>());
    }
}
