//! Push-to-pull streaming bridge.
//!
//! A producer pushes bytes (usually a backend's `stream_to` reading an
//! HTTP body or a file) on its own tokio task while the caller pulls them
//! with exact-size `read(n)` or `read_to_end()` semantics. Bytes are staged
//! in an append-only temporary file rather than memory, so a fast producer
//! can run arbitrarily far ahead of a slow consumer.
//!
//! Producer progress (`written`, `done`, `failure`) is published through a
//! `watch` channel; the consumer waits on it instead of polling. The
//! consumer's own offset is private to the reader.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{ByteSink, FileBackend, FileStoreError, FileStoreResult};

#[derive(Debug, Clone, Default)]
struct Progress {
    written: u64,
    done: bool,
    failure: Option<String>,
}

/// Producer side of a bridge
pub struct BridgeWriter {
    file: tokio::fs::File,
    progress: Arc<watch::Sender<Progress>>,
    quantum: usize,
    close_on_drop: bool,
}

impl BridgeWriter {
    /// Append bytes to the staging area and publish them to the reader
    pub async fn write(&mut self, data: &[u8]) -> FileStoreResult<()> {
        for piece in data.chunks(self.quantum) {
            self.file
                .write_all(piece)
                .await
                .map_err(|e| FileStoreError::io("bridge write", "<staging>", e))?;
            // the reader uses its own handle, so bytes must reach the OS first
            self.file
                .flush()
                .await
                .map_err(|e| FileStoreError::io("bridge write", "<staging>", e))?;
            let len = piece.len() as u64;
            self.progress.send_modify(|p| p.written += len);
        }
        Ok(())
    }

    /// Signal that no more bytes will be written
    pub fn close(&mut self) {
        self.progress.send_modify(|p| p.done = true);
    }
}

impl Drop for BridgeWriter {
    fn drop(&mut self) {
        if self.close_on_drop {
            self.progress.send_if_modified(|p| {
                let changed = !p.done;
                p.done = true;
                changed
            });
        }
    }
}

#[async_trait]
impl ByteSink for BridgeWriter {
    async fn write(&mut self, data: Bytes) -> FileStoreResult<()> {
        BridgeWriter::write(self, &data).await
    }
}

/// Consumer side of a bridge; owns the staging file
pub struct BridgeReader {
    label: String,
    file: tokio::fs::File,
    progress: watch::Receiver<Progress>,
    read: u64,
    quantum: usize,
    _staging: NamedTempFile,
}

impl BridgeReader {
    /// Wait until `n` bytes are available (or the writer finished) and
    /// return exactly `n` bytes; fewer only when the writer is done.
    /// Returns `None` once everything has been consumed.
    pub async fn read(&mut self, n: usize) -> FileStoreResult<Option<Bytes>> {
        if n == 0 {
            return Ok(Some(Bytes::new()));
        }

        let already_read = self.read;
        let wanted = n as u64;
        let snapshot = self.wait_for(|p| p.written - already_read >= wanted || p.done).await;

        let available = snapshot.written - self.read;
        let take = available.min(wanted) as usize;
        if take == 0 {
            return match snapshot.failure {
                Some(message) => Err(self.producer_failure(message)),
                None => Ok(None),
            };
        }

        let data = self.read_exact(take).await?;
        Ok(Some(data))
    }

    /// Wait for the writer to finish and return every remaining byte
    pub async fn read_to_end(&mut self) -> FileStoreResult<Bytes> {
        let snapshot = self.wait_for(|p| p.done).await;
        let remaining = (snapshot.written - self.read) as usize;
        let data = self.read_exact(remaining).await?;
        match snapshot.failure {
            Some(message) => Err(self.producer_failure(message)),
            None => Ok(data),
        }
    }

    /// Bytes consumed so far
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Discard the staging area
    pub fn close(self) {
        debug!("closing stream bridge for '{}' after {} bytes", self.label, self.read);
    }

    async fn wait_for<F>(&mut self, mut ready: F) -> Progress
    where
        F: FnMut(&Progress) -> bool,
    {
        let outcome = self.progress.wait_for(|p| ready(p)).await.map(|state| state.clone());
        match outcome {
            Ok(state) => state,
            // every sender is gone; whatever was published is final
            Err(_) => {
                let mut state = self.progress.borrow().clone();
                state.done = true;
                state
            }
        }
    }

    async fn read_exact(&mut self, len: usize) -> FileStoreResult<Bytes> {
        let mut out = BytesMut::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let step = remaining.min(self.quantum);
            let mut buf = vec![0u8; step];
            self.file
                .read_exact(&mut buf)
                .await
                .map_err(|e| FileStoreError::io("bridge read", self.label.clone(), e))?;
            out.extend_from_slice(&buf);
            remaining -= step;
        }
        self.read += len as u64;
        Ok(out.freeze())
    }

    fn producer_failed(&self) -> bool {
        self.progress.borrow().failure.is_some()
    }

    fn producer_failure(&self, message: String) -> FileStoreError {
        FileStoreError::backend_message("stream", self.label.clone(), message)
    }
}

/// Bounded handoff between a push-style producer task and a pull-style consumer
pub struct StreamBridge {
    label: String,
    reader: Option<BridgeReader>,
    producer: Option<JoinHandle<FileStoreResult<()>>>,
}

/// Marks the bridge done when the producer task ends, however it ends
struct DoneGuard(Arc<watch::Sender<Progress>>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.send_modify(|p| p.done = true);
    }
}

impl StreamBridge {
    /// A connected reader/writer pair with no producer task attached
    pub fn pipe<S: Into<String>>(label: S, quantum: usize) -> FileStoreResult<(BridgeReader, BridgeWriter)> {
        let label = label.into();
        let quantum = quantum.max(1);
        let staging = NamedTempFile::new().map_err(|e| FileStoreError::io("bridge create", label.clone(), e))?;
        let read_handle = staging
            .reopen()
            .map_err(|e| FileStoreError::io("bridge create", label.clone(), e))?;
        let write_handle = staging
            .reopen()
            .map_err(|e| FileStoreError::io("bridge create", label.clone(), e))?;

        let (tx, rx) = watch::channel(Progress::default());
        let reader = BridgeReader {
            label,
            file: tokio::fs::File::from_std(read_handle),
            progress: rx,
            read: 0,
            quantum,
            _staging: staging,
        };
        let writer = BridgeWriter {
            file: tokio::fs::File::from_std(write_handle),
            progress: Arc::new(tx),
            quantum,
            close_on_drop: true,
        };
        Ok((reader, writer))
    }

    /// Run `produce` on a background task, writing into the bridge
    pub fn spawn<S, F, Fut>(label: S, quantum: usize, produce: F) -> FileStoreResult<Self>
    where
        S: Into<String>,
        F: FnOnce(BridgeWriter) -> Fut + Send + 'static,
        Fut: Future<Output = FileStoreResult<()>> + Send + 'static,
    {
        let label = label.into();
        let (reader, mut writer) = Self::pipe(label.clone(), quantum)?;
        writer.close_on_drop = false;
        let guard = DoneGuard(writer.progress.clone());
        let task_label = label.clone();

        let producer = tokio::spawn(async move {
            let guard = guard;
            let result = produce(writer).await;
            if let Err(e) = &result {
                error!("producer for '{}' failed: {}", task_label, e);
                let message = e.to_string();
                guard.0.send_modify(|p| p.failure = Some(message));
            }
            drop(guard);
            result
        });

        debug!("spawned stream bridge producer for '{}'", label);
        Ok(Self {
            label,
            reader: Some(reader),
            producer: Some(producer),
        })
    }

    /// Bridge fed by `backend.stream_to(locator)`
    pub fn open(backend: Arc<dyn FileBackend>, locator: &str, quantum: usize) -> FileStoreResult<Self> {
        let key = locator.to_string();
        Self::spawn(locator, quantum, move |mut writer| async move {
            backend.stream_to(&key, &mut writer).await
        })
    }

    /// See [`BridgeReader::read`]. A producer failure is returned as the
    /// producer's own error.
    pub async fn read(&mut self, n: usize) -> FileStoreResult<Option<Bytes>> {
        let result = match self.reader.as_mut() {
            Some(reader) => reader.read(n).await,
            None => Ok(None),
        };
        match result {
            Err(e) => Err(self.producer_error().await.unwrap_or(e)),
            ok => ok,
        }
    }

    /// See [`BridgeReader::read_to_end`]
    pub async fn read_to_end(&mut self) -> FileStoreResult<Bytes> {
        let result = match self.reader.as_mut() {
            Some(reader) => reader.read_to_end().await,
            None => Ok(Bytes::new()),
        };
        match result {
            Err(e) => Err(self.producer_error().await.unwrap_or(e)),
            ok => ok,
        }
    }

    /// The error the producer task ended with, once the reader has seen it fail
    async fn producer_error(&mut self) -> Option<FileStoreError> {
        let failed = self.reader.as_ref().map_or(false, BridgeReader::producer_failed);
        if !failed {
            return None;
        }
        match self.producer.take()?.await {
            Ok(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// Hand the reader to `transform`, then stop the producer. A producer
    /// failure wins over the transform's own result.
    pub async fn stream_with<F, Fut, T>(mut self, transform: F) -> FileStoreResult<T>
    where
        F: FnOnce(BridgeReader) -> Fut,
        Fut: Future<Output = FileStoreResult<T>>,
    {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| FileStoreError::invalid("stream bridge reader already taken"))?;
        let outcome = transform(reader).await;
        self.finish().await?;
        outcome
    }

    /// Discard staging and stop the producer, cancelling it if still
    /// running; re-raises the producer's failure if it had one.
    pub async fn finish(mut self) -> FileStoreResult<()> {
        self.reader.take();
        let Some(producer) = self.producer.take() else {
            return Ok(());
        };

        if !producer.is_finished() {
            warn!("cancelling live producer for '{}'", self.label);
            producer.abort();
        }

        match producer.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(FileStoreError::backend("stream", self.label.clone(), e)),
        }
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            if !producer.is_finished() {
                warn!("cancelling live producer for '{}'", self.label);
                producer.abort();
            }
        }
    }
}
