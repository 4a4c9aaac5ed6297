use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::{
    ByteSource, ChunkOutcome, ContentHash, FileBackend, FileStoreError, FileStoreResult,
    StoreConfig, TransferProgress, TransferRecord, TransferRecordStore, TransferState,
};

/// Drives the chunk protocol for every transfer against one backend.
///
/// Record updates are optimistic: each write is a compare-and-swap on the
/// record version, and a conflicting write reloads the record and tries
/// again. Completion is claimed by the submitter whose swap commits the
/// full chunk set; only that submitter assembles.
pub struct TransferManager {
    backend: Arc<dyn FileBackend>,
    records: Arc<dyn TransferRecordStore>,
    config: StoreConfig,
}

impl TransferManager {
    pub fn new(
        backend: Arc<dyn FileBackend>,
        records: Arc<dyn TransferRecordStore>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            backend,
            records,
            config: config.clone(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn FileBackend> {
        &self.backend
    }

    pub fn records(&self) -> &Arc<dyn TransferRecordStore> {
        &self.records
    }

    /// Declare a transfer of `expected_size` bytes. Returns the existing
    /// record unchanged if `locator` is already known.
    pub async fn incoming(
        &self,
        locator: &str,
        expected_size: u64,
        total_chunks: Option<u32>,
    ) -> FileStoreResult<TransferRecord> {
        let total_chunks = match total_chunks {
            Some(0) => return Err(FileStoreError::invalid("a transfer needs at least one chunk")),
            Some(n) => n,
            None => self.config.chunks_for(expected_size),
        };

        let record = self
            .records
            .create(TransferRecord::new(locator, expected_size, total_chunks))
            .await?;
        info!(
            "incoming transfer '{}': {} bytes in {} chunks",
            locator, record.expected_size, record.total_chunks
        );
        Ok(record)
    }

    pub async fn record(&self, locator: &str) -> FileStoreResult<TransferRecord> {
        self.records.get(locator).await
    }

    pub async fn state(&self, locator: &str) -> FileStoreResult<TransferState> {
        Ok(self.records.get(locator).await?.state())
    }

    /// Where an interrupted transfer should resume; `None` once complete
    pub async fn start_chunk(&self, locator: &str) -> FileStoreResult<Option<u32>> {
        Ok(self.records.get(locator).await?.start_chunk())
    }

    pub async fn progress(&self, locator: &str) -> FileStoreResult<TransferProgress> {
        Ok(TransferProgress::from(&self.records.get(locator).await?))
    }

    /// Submit chunk `chunk_number` of `locator`.
    ///
    /// The chunk bytes are always written, so re-delivering a chunk
    /// replaces its bytes without counting them twice. If this submission
    /// completes the chunk set, the chunks are assembled and hashed before
    /// returning `ChunkOutcome::Completed`; an assembly failure rolls the
    /// transfer back to `Empty` and is returned.
    pub async fn put_chunk<D: Into<ByteSource>>(
        &self,
        locator: &str,
        chunk_number: u32,
        data: D,
    ) -> FileStoreResult<ChunkOutcome> {
        let data = data.into();
        let mut record = self.records.get(locator).await?;
        Self::check_accepts(&record, chunk_number)?;

        let size = self.backend.put_chunk(locator, chunk_number, data).await?;
        debug!("stored chunk {}/{} of '{}' ({} bytes)", chunk_number, record.total_chunks, locator, size);

        let committed = loop {
            let mut next = record.clone();
            next.record_chunk(chunk_number, size);

            match self.records.compare_and_swap(next).await {
                Ok(committed) => break committed,
                Err(FileStoreError::StaleRecord { .. }) => {
                    debug!("transfer '{}' changed under chunk {}, reloading", locator, chunk_number);
                    tokio::task::yield_now().await;
                    record = self.records.get(locator).await?;
                    if let Err(e) = Self::check_accepts(&record, chunk_number) {
                        if record.is_complete() {
                            self.settle_late_chunk(record, chunk_number).await?;
                        }
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        };

        if !committed.is_complete() {
            return Ok(ChunkOutcome::InProgress {
                chunks_received: committed.chunks_received.len() as u32,
                total_chunks: committed.total_chunks,
                bytes_received: committed.bytes_received,
            });
        }

        info!("transfer '{}' received all {} chunks, assembling", locator, committed.total_chunks);
        match self.assemble(&committed).await {
            Ok(record) => Ok(ChunkOutcome::Completed { record }),
            Err(e) if e.resets_transfer() => {
                error!("assembly of '{}' failed, rolling back: {}", locator, e);
                self.roll_back(locator).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn check_accepts(record: &TransferRecord, chunk_number: u32) -> FileStoreResult<()> {
        if !record.is_valid_chunk(chunk_number) {
            return Err(FileStoreError::InvalidChunkNumber {
                chunk_number,
                total_chunks: record.total_chunks,
            });
        }
        if record.is_complete() {
            return Err(FileStoreError::TransferAlreadyComplete {
                locator: record.locator.clone(),
            });
        }
        Ok(())
    }

    /// A chunk whose write landed after its transfer completed. Once the
    /// object is assembled the chunk is garbage and goes now; while the
    /// assembler is still running it is left on the record for it.
    async fn settle_late_chunk(&self, mut record: TransferRecord, chunk_number: u32) -> FileStoreResult<()> {
        let locator = record.locator.clone();
        loop {
            if !record.is_complete() {
                // rolled back; a retransmission overwrites the chunk
                return Ok(());
            }
            if record.assembled {
                self.sweep_chunks(&locator, [chunk_number]).await;
                return Ok(());
            }

            let mut next = record.clone();
            next.late_chunks.insert(chunk_number);
            match self.records.compare_and_swap(next).await {
                Ok(_) => {
                    debug!("chunk {} of '{}' arrived during assembly", chunk_number, locator);
                    return Ok(());
                }
                Err(FileStoreError::StaleRecord { .. }) => {
                    tokio::task::yield_now().await;
                    record = self.records.get(&locator).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn assemble(&self, record: &TransferRecord) -> FileStoreResult<TransferRecord> {
        let locator = record.locator.as_str();
        self.backend
            .assemble_chunks(locator, 1..=record.total_chunks, record.expected_size)
            .await?;

        let hash = self.backend.content_hash(locator).await?;
        let previous = record.content_hash.clone();
        let mut late = Vec::new();
        let committed = self
            .update_record(locator, |r| {
                if let Some(expected) = &previous {
                    if *expected != hash {
                        return Err(FileStoreError::HashMismatch {
                            expected: expected.to_string(),
                            actual: hash.to_string(),
                        });
                    }
                }
                r.content_hash = Some(hash.clone());
                r.assembled = true;
                late = std::mem::take(&mut r.late_chunks).into_iter().collect();
                Ok(())
            })
            .await?;

        self.sweep_chunks(locator, late).await;
        Ok(committed)
    }

    /// Best-effort removal of chunk objects no record needs any more
    async fn sweep_chunks<I>(&self, locator: &str, chunks: I)
    where
        I: IntoIterator<Item = u32>,
    {
        for chunk_number in chunks {
            if let Err(e) = self.backend.delete_chunk(locator, chunk_number).await {
                debug!("ignoring cleanup failure for chunk {} of '{}': {}", chunk_number, locator, e);
            }
        }
    }

    /// Reset `locator` to `Empty`
    async fn roll_back(&self, locator: &str) -> FileStoreResult<()> {
        self.update_record(locator, |r| {
            r.reset();
            Ok(())
        })
        .await?;
        info!("transfer '{}' rolled back, every chunk must be sent again", locator);
        Ok(())
    }

    /// Apply `mutate` to the stored record, reloading and reapplying on
    /// every version conflict.
    async fn update_record<F>(&self, locator: &str, mut mutate: F) -> FileStoreResult<TransferRecord>
    where
        F: FnMut(&mut TransferRecord) -> FileStoreResult<()> + Send,
    {
        loop {
            let mut record = self.records.get(locator).await?;
            mutate(&mut record)?;
            match self.records.compare_and_swap(record).await {
                Ok(committed) => return Ok(committed),
                Err(FileStoreError::StaleRecord { .. }) => {
                    debug!("transfer '{}' changed concurrently, reapplying update", locator);
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record a whole object that was written outside the chunk protocol
    async fn record_whole_object(
        &self,
        locator: &str,
        size: u64,
        hash: ContentHash,
        verify_against: Option<ContentHash>,
    ) -> FileStoreResult<TransferRecord> {
        if let Some(expected) = verify_against {
            if expected != hash {
                return Err(FileStoreError::HashMismatch {
                    expected: expected.to_string(),
                    actual: hash.to_string(),
                });
            }
        }

        self.records.create(TransferRecord::new(locator, size, 1)).await?;
        let mut stray = Vec::new();
        let record = self
            .update_record(locator, |r| {
                // chunks of a transfer this object replaces
                stray = if r.assembled {
                    r.late_chunks.iter().copied().collect()
                } else {
                    (1..=r.total_chunks).collect()
                };
                r.content_hash = None;
                r.mark_complete(size);
                r.content_hash = Some(hash.clone());
                Ok(())
            })
            .await?;

        self.sweep_chunks(locator, stray).await;
        Ok(record)
    }

    /// Write a whole object in one shot. Any previous hash is discarded,
    /// so overwriting with new contents is not a mismatch.
    pub async fn put_contents<D: Into<ByteSource>>(&self, locator: &str, data: D) -> FileStoreResult<TransferRecord> {
        let size = self.backend.put(locator, data.into()).await?;
        let hash = self.backend.content_hash(locator).await?;
        let record = self.record_whole_object(locator, size, hash, None).await?;
        info!("stored '{}' in one piece ({} bytes)", locator, size);
        Ok(record)
    }

    /// Copy a complete transfer to a new locator, verifying the copy
    /// against the source's recorded hash.
    pub async fn copy_from(&self, source_locator: &str, target_locator: &str) -> FileStoreResult<TransferRecord> {
        let source = self.records.get(source_locator).await?;
        if !source.is_complete() {
            return Err(FileStoreError::invalid(format!(
                "cannot copy '{}': transfer is not complete",
                source_locator
            )));
        }

        self.backend
            .copy(source_locator, target_locator, source.expected_size)
            .await?;
        let hash = self.backend.content_hash(target_locator).await?;
        let record = self
            .record_whole_object(target_locator, source.expected_size, hash, source.content_hash.clone())
            .await?;
        info!("copied '{}' to '{}'", source_locator, target_locator);
        Ok(record)
    }

    /// Fetch `url` into `locator`; the body must be exactly `expected_size` bytes
    pub async fn copy_from_url(&self, locator: &str, url: &str, expected_size: u64) -> FileStoreResult<TransferRecord> {
        self.backend.copy_from_url(locator, url, expected_size).await?;
        let hash = self.backend.content_hash(locator).await?;
        self.record_whole_object(locator, expected_size, hash, None).await
    }

    /// The object's bytes once the transfer is complete, `None` before
    pub async fn get_contents(&self, locator: &str) -> FileStoreResult<Option<Bytes>> {
        let record = self.records.get(locator).await?;
        if !record.is_complete() {
            return Ok(None);
        }
        Ok(Some(self.backend.get(locator).await?))
    }

    pub async fn matches_hash(&self, locator: &str, hash: &ContentHash) -> FileStoreResult<bool> {
        let record = self.records.get(locator).await?;
        Ok(record.content_hash.as_ref() == Some(hash))
    }

    /// Delete the object, any stray chunks and the record
    pub async fn discard(&self, locator: &str) -> FileStoreResult<()> {
        let total_chunks = match self.records.get(locator).await {
            Ok(record) => record.total_chunks,
            Err(FileStoreError::TransferNotFound { .. }) => 0,
            Err(e) => return Err(e),
        };

        self.backend.delete(locator).await?;
        self.sweep_chunks(locator, 1..=total_chunks).await;
        self.records.delete(locator).await?;
        info!("discarded '{}'", locator);
        Ok(())
    }
}
