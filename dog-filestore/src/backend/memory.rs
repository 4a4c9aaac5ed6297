use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::info;

use super::{check_declared_size, FileBackend};
use crate::config::DEFAULT_READ_QUANTUM;
use crate::{ByteSink, ByteSource, FileStoreError, FileStoreResult};

/// Process-local object store for tests and development
#[derive(Debug)]
pub struct InMemoryBackend {
    objects: RwLock<HashMap<String, Bytes>>,
    read_quantum: usize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_read_quantum(DEFAULT_READ_QUANTUM)
    }

    pub fn with_read_quantum(read_quantum: usize) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            read_quantum: read_quantum.max(1),
        }
    }

    /// Number of stored objects, chunks included
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Every stored locator, sorted
    pub fn locators(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "InMemory"
    }

    fn read_quantum(&self) -> usize {
        self.read_quantum
    }

    async fn exists(&self, locator: &str) -> FileStoreResult<bool> {
        Ok(self.objects.read().contains_key(locator))
    }

    async fn put(&self, locator: &str, mut source: ByteSource) -> FileStoreResult<u64> {
        let declared = source.size();
        let mut data = BytesMut::new();
        while let Some(piece) = source.next_quantum(self.read_quantum).await? {
            data.extend_from_slice(&piece);
        }
        source.finish().await?;

        let len = data.len() as u64;
        check_declared_size(declared, len)?;
        self.objects.write().insert(locator.to_string(), data.freeze());
        info!("stored {} bytes at '{}'", len, locator);
        Ok(len)
    }

    async fn stream_to(&self, locator: &str, sink: &mut dyn ByteSink) -> FileStoreResult<()> {
        let data = self
            .objects
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| FileStoreError::not_found(locator))?;

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.read_quantum).min(data.len());
            sink.write(data.slice(offset..end)).await?;
            offset = end;
        }
        Ok(())
    }

    async fn delete(&self, locator: &str) -> FileStoreResult<()> {
        if self.objects.write().remove(locator).is_some() {
            info!("deleted '{}'", locator);
        }
        Ok(())
    }

    async fn rename(&self, old_locator: &str, new_locator: &str) -> FileStoreResult<()> {
        let mut objects = self.objects.write();
        let data = objects
            .remove(old_locator)
            .ok_or_else(|| FileStoreError::not_found(old_locator))?;
        objects.insert(new_locator.to_string(), data);
        drop(objects);

        info!("renamed '{}' to '{}'", old_locator, new_locator);
        Ok(())
    }

    async fn size(&self, locator: &str) -> FileStoreResult<u64> {
        self.objects
            .read()
            .get(locator)
            .map(|data| data.len() as u64)
            .ok_or_else(|| FileStoreError::not_found(locator))
    }
}
