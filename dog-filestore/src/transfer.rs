use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ContentHash, FileStoreResult};

/// Where a transfer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Declared, nothing received yet (or rolled back)
    Empty,
    /// Some chunks received, some outstanding
    InProgress,
    /// Every chunk received
    Complete,
}

/// Bookkeeping for one chunked transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub locator: String,
    pub expected_size: u64,
    pub total_chunks: u32,
    pub chunks_received: BTreeSet<u32>,
    pub bytes_received: u64,
    pub content_hash: Option<ContentHash>,
    /// Re-delivered chunks written after the set completed but before
    /// assembly finished; the assembler deletes them once it commits.
    #[serde(default)]
    pub late_chunks: BTreeSet<u32>,
    /// Set once the object for the current chunk set has been written
    #[serde(default)]
    pub assembled: bool,
    /// Bumped by the record store on every successful write
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TransferRecord {
    pub fn new<S: Into<String>>(locator: S, expected_size: u64, total_chunks: u32) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            locator: locator.into(),
            expected_size,
            total_chunks: total_chunks.max(1),
            chunks_received: BTreeSet::new(),
            bytes_received: 0,
            content_hash: None,
            late_chunks: BTreeSet::new(),
            assembled: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> TransferState {
        if self.chunks_received.is_empty() {
            TransferState::Empty
        } else if self.is_complete() {
            TransferState::Complete
        } else {
            TransferState::InProgress
        }
    }

    /// True iff every chunk in `1..=total_chunks` has been received
    pub fn is_complete(&self) -> bool {
        self.chunks_received.len() == self.total_chunks as usize
            && self.chunks_received.iter().all(|n| (1..=self.total_chunks).contains(n))
    }

    pub fn is_valid_chunk(&self, chunk_number: u32) -> bool {
        (1..=self.total_chunks).contains(&chunk_number)
    }

    /// Lowest chunk number not yet received; `None` once complete
    pub fn start_chunk(&self) -> Option<u32> {
        (1..=self.total_chunks).find(|n| !self.chunks_received.contains(n))
    }

    /// Record a chunk arrival. Re-delivery of a known chunk number leaves
    /// the byte count untouched. Returns true if the chunk was new.
    pub fn record_chunk(&mut self, chunk_number: u32, size: u64) -> bool {
        let fresh = self.chunks_received.insert(chunk_number);
        if fresh {
            self.bytes_received += size;
        }
        fresh
    }

    /// Back to `Empty`; every chunk must be sent again
    pub fn reset(&mut self) {
        self.chunks_received.clear();
        self.late_chunks.clear();
        self.assembled = false;
        self.bytes_received = 0;
    }

    /// Mark the whole object as received in one piece
    pub fn mark_complete(&mut self, size: u64) {
        self.total_chunks = 1;
        self.chunks_received = BTreeSet::from([1]);
        self.late_chunks.clear();
        self.assembled = true;
        self.bytes_received = size;
        self.expected_size = size;
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

/// Persistence for transfer records with optimistic concurrency
#[async_trait]
pub trait TransferRecordStore: Send + Sync {
    /// Insert a new record; returns the existing one unchanged if the
    /// locator is already known.
    async fn create(&self, record: TransferRecord) -> FileStoreResult<TransferRecord>;

    /// Fails with `TransferNotFound` if absent
    async fn get(&self, locator: &str) -> FileStoreResult<TransferRecord>;

    /// Store `record` only if the stored version still equals
    /// `record.version`; the stored copy gets the next version. Fails with
    /// `StaleRecord` if someone else wrote first.
    async fn compare_and_swap(&self, record: TransferRecord) -> FileStoreResult<TransferRecord>;

    /// Remove the record; absent records are not an error
    async fn delete(&self, locator: &str) -> FileStoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_follows_received_chunks() {
        let mut record = TransferRecord::new("doc", 60, 3);
        assert_eq!(record.state(), TransferState::Empty);
        assert_eq!(record.start_chunk(), Some(1));

        record.record_chunk(2, 20);
        assert_eq!(record.state(), TransferState::InProgress);
        assert_eq!(record.start_chunk(), Some(1));

        record.record_chunk(1, 20);
        record.record_chunk(3, 20);
        assert_eq!(record.state(), TransferState::Complete);
        assert_eq!(record.start_chunk(), None);

        record.reset();
        assert_eq!(record.state(), TransferState::Empty);
        assert_eq!(record.bytes_received, 0);
    }

    #[test]
    fn redelivered_chunks_are_not_double_counted() {
        let mut record = TransferRecord::new("doc", 40, 2);
        assert!(record.record_chunk(1, 20));
        assert!(!record.record_chunk(1, 20));
        assert_eq!(record.bytes_received, 20);
    }

    #[test]
    fn chunk_numbers_are_one_based() {
        let record = TransferRecord::new("doc", 40, 2);
        assert!(!record.is_valid_chunk(0));
        assert!(record.is_valid_chunk(1));
        assert!(record.is_valid_chunk(2));
        assert!(!record.is_valid_chunk(3));
    }
}
