use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{FileStoreError, FileStoreResult, TransferRecord, TransferRecordStore};

/// In-process arena of transfer records with atomic version bumps
#[derive(Debug, Default)]
pub struct MemoryTransferRecordStore {
    records: Mutex<HashMap<String, TransferRecord>>,
}

impl MemoryTransferRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl TransferRecordStore for MemoryTransferRecordStore {
    async fn create(&self, mut record: TransferRecord) -> FileStoreResult<TransferRecord> {
        let mut records = self.records.lock();
        if let Some(existing) = records.get(&record.locator) {
            return Ok(existing.clone());
        }
        record.version = 1;
        records.insert(record.locator.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, locator: &str) -> FileStoreResult<TransferRecord> {
        self.records
            .lock()
            .get(locator)
            .cloned()
            .ok_or_else(|| FileStoreError::TransferNotFound {
                locator: locator.to_string(),
            })
    }

    async fn compare_and_swap(&self, mut record: TransferRecord) -> FileStoreResult<TransferRecord> {
        let mut records = self.records.lock();
        let current = records
            .get(&record.locator)
            .ok_or_else(|| FileStoreError::TransferNotFound {
                locator: record.locator.clone(),
            })?;

        if current.version != record.version {
            return Err(FileStoreError::StaleRecord {
                locator: record.locator.clone(),
                expected: record.version,
            });
        }

        record.version += 1;
        record.touch();
        records.insert(record.locator.clone(), record.clone());
        Ok(record)
    }

    async fn delete(&self, locator: &str) -> FileStoreResult<()> {
        self.records.lock().remove(locator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = MemoryTransferRecordStore::new();
        let first = store.create(TransferRecord::new("doc", 100, 5)).await.unwrap();
        let second = store.create(TransferRecord::new("doc", 999, 9)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.expected_size, 100);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn stale_writes_are_rejected() {
        let store = MemoryTransferRecordStore::new();
        let record = store.create(TransferRecord::new("doc", 40, 2)).await.unwrap();

        let mut winner = record.clone();
        winner.record_chunk(1, 20);
        let committed = store.compare_and_swap(winner).await.unwrap();
        assert_eq!(committed.version, record.version + 1);

        let mut loser = record.clone();
        loser.record_chunk(2, 20);
        assert!(matches!(
            store.compare_and_swap(loser).await,
            Err(FileStoreError::StaleRecord { .. })
        ));

        let stored = store.get("doc").await.unwrap();
        assert_eq!(stored.chunks_received.len(), 1);
        assert!(stored.chunks_received.contains(&1));
    }

    #[tokio::test]
    async fn missing_records_are_reported() {
        let store = MemoryTransferRecordStore::new();
        assert!(matches!(
            store.get("nothing").await,
            Err(FileStoreError::TransferNotFound { .. })
        ));
        store.delete("nothing").await.unwrap();
    }
}
