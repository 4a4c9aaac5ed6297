pub mod fs;
pub mod memory;
pub mod tracker;

use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::sink::{HashingSink, SizeCounter};
use crate::{
    BackendConfig, ByteSink, ByteSource, ContentHash, FileStoreError, FileStoreResult, StoreConfig,
    StreamBridge,
};

pub use fs::FileSystemBackend;
pub use memory::InMemoryBackend;
pub use tracker::TrackerBackend;

/// Prefix of every derived chunk locator
pub const CHUNK_PREFIX: &str = "chunk";

/// Storage primitives every backend variant provides.
///
/// A variant only has to implement `exists`, `put`, `stream_to`, `delete`
/// and `rename`; every other operation has a default built on `stream_to`
/// and `put`, and may be overridden with something cheaper.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// Short name used in logs and status strings
    fn name(&self) -> &'static str;

    /// Maximum bytes moved per I/O call
    fn read_quantum(&self) -> usize;

    async fn exists(&self, locator: &str) -> FileStoreResult<bool>;

    /// Write `source` to `locator`, replacing any existing object.
    /// Returns the number of bytes written. A failed put, including a
    /// source that yields a different number of bytes than it declared
    /// (`SizeMismatch`), leaves any existing object untouched.
    async fn put(&self, locator: &str, source: ByteSource) -> FileStoreResult<u64>;

    /// Push the object to `sink` one read quantum at a time, in order.
    /// Fails with `NotFound` if the object is absent.
    async fn stream_to(&self, locator: &str, sink: &mut dyn ByteSink) -> FileStoreResult<()>;

    /// Remove the object; absent objects are not an error
    async fn delete(&self, locator: &str) -> FileStoreResult<()>;

    /// Move an object; fails with `NotFound` if `old_locator` is absent
    async fn rename(&self, old_locator: &str, new_locator: &str) -> FileStoreResult<()>;

    async fn get(&self, locator: &str) -> FileStoreResult<Bytes> {
        let mut buffer = BytesMut::new();
        self.stream_to(locator, &mut buffer).await?;
        debug!("get read {} bytes for '{}'", buffer.len(), locator);
        Ok(buffer.freeze())
    }

    async fn size(&self, locator: &str) -> FileStoreResult<u64> {
        let mut counter = SizeCounter::default();
        self.stream_to(locator, &mut counter).await?;
        Ok(counter.total)
    }

    async fn content_hash(&self, locator: &str) -> FileStoreResult<ContentHash> {
        let mut hasher = HashingSink::new();
        self.stream_to(locator, &mut hasher).await?;
        Ok(hasher.finish())
    }

    /// Copy one object to another locator
    async fn copy(&self, from_locator: &str, to_locator: &str, expected_size: u64) -> FileStoreResult<()> {
        let data = self.get(from_locator).await?;
        if data.len() as u64 != expected_size {
            return Err(FileStoreError::SizeMismatch {
                expected: expected_size,
                actual: data.len() as u64,
            });
        }
        self.put(to_locator, ByteSource::buffer(data)).await?;
        Ok(())
    }

    /// HTTP client used for URL copies
    fn http_client(&self) -> reqwest::Client {
        reqwest::Client::new()
    }

    /// Fetch `url` over HTTP and store the body at `to_locator`, streaming
    /// through a bridge so the body is never held in memory. On failure an
    /// object already at `to_locator` keeps its contents; one that did not
    /// exist before is removed.
    async fn copy_from_url(&self, to_locator: &str, url: &str, expected_size: u64) -> FileStoreResult<()> {
        let quantum = self.read_quantum();
        let client = self.http_client();
        let source_url = url.to_string();
        let existed = self.exists(to_locator).await?;
        let bridge = StreamBridge::spawn(url, quantum, move |mut writer| async move {
            crate::http::fetch_to_sink(&client, &source_url, quantum, &mut writer).await?;
            Ok::<(), FileStoreError>(())
        })?;

        let result = self
            .put(to_locator, ByteSource::bridge(bridge).with_size(expected_size))
            .await
            .and_then(|written| check_declared_size(Some(expected_size), written).map(|()| written));

        match result {
            Ok(written) => {
                info!("copied {} bytes from {} to '{}'", written, url, to_locator);
                Ok(())
            }
            Err(e) => {
                if !existed {
                    if let Err(cleanup) = self.delete(to_locator).await {
                        debug!("ignoring cleanup failure for '{}': {}", to_locator, cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    /// An HTTP URL the object can be fetched from directly
    async fn forwardable_url(&self, _locator: &str) -> FileStoreResult<String> {
        Err(FileStoreError::Unsupported {
            operation: "forwardable_url",
        })
    }

    /// Round-trip self-test: write a probe, read it back, delete it
    async fn status(&self) -> FileStoreResult<String> {
        let probe = format!("{}Test-{}-{}", self.name().replace(' ', ""), std::process::id(), Uuid::new_v4().simple());
        let payload = Bytes::from(format!("probe {}", chrono::Utc::now().timestamp_micros()));

        let check = async {
            self.put(&probe, ByteSource::buffer(payload.clone())).await?;
            let readback = self.get(&probe).await?;
            if readback != payload {
                return Err(FileStoreError::backend_message(
                    "status",
                    probe.clone(),
                    format!("{} test failed: readback did not match", self.name()),
                ));
            }
            self.delete(&probe).await
        };

        check
            .await
            .map_err(|e| FileStoreError::io("status", probe.clone(), std::io::Error::other(e)))?;
        Ok(format!("{} backend OK", self.name()))
    }

    /// Deterministic locator of one chunk of `locator`
    fn chunk_locator(&self, locator: &str, chunk_number: u32) -> String {
        format!("{}_{}_{}", CHUNK_PREFIX, locator, chunk_number)
    }

    async fn put_chunk(&self, locator: &str, chunk_number: u32, data: ByteSource) -> FileStoreResult<u64> {
        self.put(&self.chunk_locator(locator, chunk_number), data).await
    }

    async fn get_chunk(&self, locator: &str, chunk_number: u32) -> FileStoreResult<Bytes> {
        self.get(&self.chunk_locator(locator, chunk_number)).await
    }

    async fn delete_chunk(&self, locator: &str, chunk_number: u32) -> FileStoreResult<()> {
        self.delete(&self.chunk_locator(locator, chunk_number)).await
    }

    /// Concatenate `chunks` in ascending order into `locator`, checking the
    /// total against `expected_size`. Every chunk in the range is deleted
    /// afterwards whether or not assembly succeeded.
    async fn assemble_chunks(
        &self,
        locator: &str,
        chunks: RangeInclusive<u32>,
        expected_size: u64,
    ) -> FileStoreResult<u64> {
        let result = self.concatenate_chunks(locator, chunks.clone(), expected_size).await;

        for chunk_number in chunks {
            // one missing chunk must not stop cleanup of the rest
            if let Err(e) = self.delete_chunk(locator, chunk_number).await {
                debug!("ignoring cleanup failure for chunk {} of '{}': {}", chunk_number, locator, e);
            }
        }
        result
    }

    #[doc(hidden)]
    async fn concatenate_chunks(
        &self,
        locator: &str,
        chunks: RangeInclusive<u32>,
        expected_size: u64,
    ) -> FileStoreResult<u64> {
        let staging = tempfile::tempfile().map_err(|e| FileStoreError::io("assemble", locator, e))?;
        let mut staging = tokio::fs::File::from_std(staging);

        for chunk_number in chunks {
            let chunk = self.chunk_locator(locator, chunk_number);
            self.stream_to(&chunk, &mut staging).await?;
        }
        staging.flush().await.map_err(|e| FileStoreError::io("assemble", locator, e))?;

        let assembled = staging
            .metadata()
            .await
            .map_err(|e| FileStoreError::io("assemble", locator, e))?
            .len();
        if assembled != expected_size {
            return Err(FileStoreError::SizeMismatch {
                expected: expected_size,
                actual: assembled,
            });
        }

        staging
            .seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| FileStoreError::io("assemble", locator, e))?;
        let written = self
            .put(locator, ByteSource::reader(staging).with_size(assembled))
            .await?;
        info!("assembled {} bytes into '{}'", written, locator);
        Ok(written)
    }
}

/// A source that declared its size must yield exactly that many bytes
pub(crate) fn check_declared_size(declared: Option<u64>, written: u64) -> FileStoreResult<()> {
    match declared {
        Some(expected) if expected != written => Err(FileStoreError::SizeMismatch {
            expected,
            actual: written,
        }),
        _ => Ok(()),
    }
}

/// Construct the single backend described by `config`
pub async fn open_backend(config: &StoreConfig) -> FileStoreResult<Arc<dyn FileBackend>> {
    config.validate()?;
    let backend: Arc<dyn FileBackend> = match &config.backend {
        BackendConfig::FileSystem { base_path } => {
            Arc::new(FileSystemBackend::new(base_path, config.read_quantum).await?)
        }
        BackendConfig::Tracker(tracker) => {
            Arc::new(TrackerBackend::new(tracker.clone(), config.read_quantum)?)
        }
        BackendConfig::InMemory => Arc::new(InMemoryBackend::with_read_quantum(config.read_quantum)),
    };
    info!("opened {} backend", backend.name());
    Ok(backend)
}
