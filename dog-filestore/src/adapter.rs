use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use crate::{
    open_backend, BridgeReader, ByteSource, ChunkOutcome, ContentHash, FileBackend, FileStoreResult,
    MemoryTransferRecordStore, StoreConfig, StreamBridge, TransferManager, TransferProgress,
    TransferRecord, TransferRecordStore,
};

/// The storage engine an application embeds: one explicitly constructed
/// backend plus the transfer manager that tracks chunked uploads into it.
pub struct FileStore {
    backend: Arc<dyn FileBackend>,
    transfers: TransferManager,
    config: StoreConfig,
}

impl FileStore {
    /// Construct the configured backend with in-memory transfer records
    pub async fn open(config: StoreConfig) -> FileStoreResult<Self> {
        let backend = open_backend(&config).await?;
        Ok(Self::with_backend(backend, Arc::new(MemoryTransferRecordStore::new()), config))
    }

    /// Use an already constructed backend and record store
    pub fn with_backend(
        backend: Arc<dyn FileBackend>,
        records: Arc<dyn TransferRecordStore>,
        config: StoreConfig,
    ) -> Self {
        let transfers = TransferManager::new(backend.clone(), records, &config);
        Self {
            backend,
            transfers,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn FileBackend> {
        &self.backend
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Pull-style view of an object: `backend.stream_to` feeds a bridge on
    /// a background task while `transform` reads from it. The producer is
    /// stopped when `transform` returns and its failure, if any, wins.
    pub async fn stream_with<F, Fut, T>(&self, locator: &str, transform: F) -> FileStoreResult<T>
    where
        F: FnOnce(BridgeReader) -> Fut,
        Fut: Future<Output = FileStoreResult<T>>,
    {
        StreamBridge::open(self.backend.clone(), locator, self.config.read_quantum)?
            .stream_with(transform)
            .await
    }

    pub async fn status(&self) -> FileStoreResult<String> {
        self.backend.status().await
    }

    pub async fn incoming(&self, locator: &str, expected_size: u64) -> FileStoreResult<TransferRecord> {
        self.transfers.incoming(locator, expected_size, None).await
    }

    pub async fn put_chunk<D: Into<ByteSource>>(
        &self,
        locator: &str,
        chunk_number: u32,
        data: D,
    ) -> FileStoreResult<ChunkOutcome> {
        self.transfers.put_chunk(locator, chunk_number, data).await
    }

    pub async fn start_chunk(&self, locator: &str) -> FileStoreResult<Option<u32>> {
        self.transfers.start_chunk(locator).await
    }

    pub async fn progress(&self, locator: &str) -> FileStoreResult<TransferProgress> {
        self.transfers.progress(locator).await
    }

    pub async fn put_contents<D: Into<ByteSource>>(&self, locator: &str, data: D) -> FileStoreResult<TransferRecord> {
        self.transfers.put_contents(locator, data).await
    }

    pub async fn get_contents(&self, locator: &str) -> FileStoreResult<Option<Bytes>> {
        self.transfers.get_contents(locator).await
    }

    pub async fn matches_hash(&self, locator: &str, hash: &ContentHash) -> FileStoreResult<bool> {
        self.transfers.matches_hash(locator, hash).await
    }

    pub async fn discard(&self, locator: &str) -> FileStoreResult<()> {
        self.transfers.discard(locator).await
    }
}
