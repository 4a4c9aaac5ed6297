use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::{ContentHash, FileStoreError, FileStoreResult};

/// Receiver of pushed bytes; `FileBackend::stream_to` calls `write` once
/// per quantum, in order.
#[async_trait]
pub trait ByteSink: Send {
    async fn write(&mut self, data: Bytes) -> FileStoreResult<()>;
}

#[async_trait]
impl ByteSink for BytesMut {
    async fn write(&mut self, data: Bytes) -> FileStoreResult<()> {
        self.extend_from_slice(&data);
        Ok(())
    }
}

#[async_trait]
impl ByteSink for tokio::fs::File {
    async fn write(&mut self, data: Bytes) -> FileStoreResult<()> {
        self.write_all(&data)
            .await
            .map_err(|e| FileStoreError::io("write", "<staging file>", e))
    }
}

/// Running byte total
#[derive(Debug, Default)]
pub struct SizeCounter {
    pub total: u64,
}

#[async_trait]
impl ByteSink for SizeCounter {
    async fn write(&mut self, data: Bytes) -> FileStoreResult<()> {
        self.total += data.len() as u64;
        Ok(())
    }
}

/// Running SHA-256 digest
#[derive(Default)]
pub struct HashingSink {
    hasher: Sha256,
}

impl HashingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> ContentHash {
        ContentHash::new(ContentHash::SHA256, &self.hasher.finalize())
    }
}

#[async_trait]
impl ByteSink for HashingSink {
    async fn write(&mut self, data: Bytes) -> FileStoreResult<()> {
        self.hasher.update(&data);
        Ok(())
    }
}

/// Adapts a plain callback into a sink
pub struct FnSink<F>(pub F);

#[async_trait]
impl<F> ByteSink for FnSink<F>
where
    F: FnMut(Bytes) -> FileStoreResult<()> + Send,
{
    async fn write(&mut self, data: Bytes) -> FileStoreResult<()> {
        (self.0)(data)
    }
}

/// Wrap a callback as a sink
pub fn sink_fn<F>(callback: F) -> FnSink<F>
where
    F: FnMut(Bytes) -> FileStoreResult<()> + Send,
{
    FnSink(callback)
}
