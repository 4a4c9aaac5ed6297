use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{check_declared_size, FileBackend};
use crate::{ByteSink, ByteSource, FileStoreError, FileStoreResult};

/// Name prefix of in-flight writes inside the base directory
const STAGING_PREFIX: &str = ".staging-";

/// Objects stored as plain files directly under one base directory
#[derive(Debug, Clone)]
pub struct FileSystemBackend {
    base_path: PathBuf,
    read_quantum: usize,
}

impl FileSystemBackend {
    /// Open (creating if needed) the directory every object is rooted under
    pub async fn new<P: AsRef<Path>>(base_path: P, read_quantum: usize) -> FileStoreResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_path).await.map_err(|e| {
            FileStoreError::configuration(format!(
                "cannot initialize file system backend at {}: {}",
                base_path.display(),
                e
            ))
        })?;
        Ok(Self {
            base_path,
            read_quantum: read_quantum.max(1),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, locator: &str) -> FileStoreResult<PathBuf> {
        if locator.is_empty() || locator.contains('/') || locator.contains('\\') || locator.contains("..") {
            return Err(FileStoreError::invalid(format!(
                "locator '{}' is not a plain file name",
                locator
            )));
        }
        Ok(self.base_path.join(locator))
    }
}

fn map_missing(operation: &'static str, locator: &str, e: std::io::Error) -> FileStoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        FileStoreError::not_found(locator)
    } else {
        FileStoreError::io(operation, locator, e)
    }
}

#[async_trait]
impl FileBackend for FileSystemBackend {
    fn name(&self) -> &'static str {
        "FileSystem"
    }

    fn read_quantum(&self) -> usize {
        self.read_quantum
    }

    async fn exists(&self, locator: &str) -> FileStoreResult<bool> {
        let path = self.path_for(locator)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| FileStoreError::io("exists", locator, e))
    }

    async fn put(&self, locator: &str, mut source: ByteSource) -> FileStoreResult<u64> {
        let path = self.path_for(locator)?;
        let declared = source.size();

        // Staged beside the target so a failed put leaves the old object alone
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&self.base_path)
            .map_err(|e| FileStoreError::io("put", locator, e))?;
        let (file, staging_path) = staging.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let written = if let Some(data) = source.as_buffer().cloned() {
            // Small in-memory payloads go out in one write
            file.write_all(&data)
                .await
                .map_err(|e| FileStoreError::io("put", locator, e))?;
            data.len() as u64
        } else {
            let mut written = 0u64;
            while let Some(piece) = source.next_quantum(self.read_quantum).await? {
                file.write_all(&piece)
                    .await
                    .map_err(|e| FileStoreError::io("put", locator, e))?;
                written += piece.len() as u64;
            }
            written
        };
        source.finish().await?;
        file.flush().await.map_err(|e| FileStoreError::io("put", locator, e))?;
        drop(file);
        check_declared_size(declared, written)?;

        staging_path
            .persist(&path)
            .map_err(|e| FileStoreError::io("put", locator, e.error))?;
        info!("stored {} bytes at '{}'", written, locator);
        Ok(written)
    }

    async fn stream_to(&self, locator: &str, sink: &mut dyn ByteSink) -> FileStoreResult<()> {
        let path = self.path_for(locator)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| map_missing("stream", locator, e))?;

        let mut buf = vec![0u8; self.read_quantum];
        loop {
            let read = file
                .read(&mut buf)
                .await
                .map_err(|e| FileStoreError::io("stream", locator, e))?;
            if read == 0 {
                return Ok(());
            }
            sink.write(Bytes::copy_from_slice(&buf[..read])).await?;
        }
    }

    async fn delete(&self, locator: &str) -> FileStoreResult<()> {
        let path = self.path_for(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("deleted '{}'", locator);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("delete of absent '{}' ignored", locator);
                Ok(())
            }
            Err(e) => Err(FileStoreError::io("delete", locator, e)),
        }
    }

    async fn rename(&self, old_locator: &str, new_locator: &str) -> FileStoreResult<()> {
        let from = self.path_for(old_locator)?;
        let to = self.path_for(new_locator)?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| map_missing("rename", old_locator, e))?;
        info!("renamed '{}' to '{}'", old_locator, new_locator);
        Ok(())
    }

    async fn size(&self, locator: &str) -> FileStoreResult<u64> {
        let path = self.path_for(locator)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| map_missing("size", locator, e))?;
        Ok(metadata.len())
    }

    async fn copy(&self, from_locator: &str, to_locator: &str, expected_size: u64) -> FileStoreResult<()> {
        let actual = self.size(from_locator).await?;
        if actual != expected_size {
            return Err(FileStoreError::SizeMismatch {
                expected: expected_size,
                actual,
            });
        }
        let from = self.path_for(from_locator)?;
        let to = self.path_for(to_locator)?;
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| map_missing("copy", from_locator, e))?;
        info!("copied '{}' to '{}'", from_locator, to_locator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locators_with_path_components_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path(), 16).await.unwrap();

        for bad in ["../escape", "a/b", "a\\b", ".."] {
            assert!(matches!(
                backend.exists(bad).await,
                Err(FileStoreError::Invalid { .. })
            ));
        }
    }

    #[tokio::test]
    async fn reader_sources_are_streamed_in_quanta() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path(), 3).await.unwrap();
        let payload = b"streamed through a reader".to_vec();

        let written = backend
            .put("doc", ByteSource::reader(std::io::Cursor::new(payload.clone())))
            .await
            .unwrap();

        assert_eq!(written, payload.len() as u64);
        assert_eq!(backend.get("doc").await.unwrap(), Bytes::from(payload));
    }

    #[tokio::test]
    async fn native_size_reports_missing_objects() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path(), 16).await.unwrap();
        assert!(matches!(
            backend.size("nothing").await,
            Err(FileStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn native_copy_checks_expected_size() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path(), 16).await.unwrap();
        backend.put("src", ByteSource::from("twelve bytes")).await.unwrap();

        assert!(matches!(
            backend.copy("src", "dst", 5).await,
            Err(FileStoreError::SizeMismatch { expected: 5, actual: 12 })
        ));
        assert!(!backend.exists("dst").await.unwrap());

        backend.copy("src", "dst", 12).await.unwrap();
        assert_eq!(backend.get("dst").await.unwrap(), Bytes::from("twelve bytes"));
    }
}
