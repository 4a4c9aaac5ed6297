use serde::{Deserialize, Serialize};

use crate::TransferRecord;

/// Result of submitting one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunks are still outstanding
    InProgress {
        chunks_received: u32,
        total_chunks: u32,
        bytes_received: u64,
    },
    /// This submission completed the transfer and the object was assembled
    Completed { record: TransferRecord },
}

impl ChunkOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Snapshot of how far a transfer has got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub chunks_received: u32,
    pub total_chunks: u32,
    pub bytes_received: u64,
    pub expected_size: u64,
    /// Whole percent of `expected_size` received, capped at 100
    pub percent: u8,
}

impl From<&TransferRecord> for TransferProgress {
    fn from(record: &TransferRecord) -> Self {
        let percent = if record.expected_size == 0 {
            if record.is_complete() {
                100
            } else {
                0
            }
        } else {
            (record.bytes_received.saturating_mul(100) / record.expected_size).min(100) as u8
        };
        Self {
            chunks_received: record.chunks_received.len() as u32,
            total_chunks: record.total_chunks,
            bytes_received: record.bytes_received,
            expected_size: record.expected_size,
            percent,
        }
    }
}
