//! Distributed object store addressed through trackers.
//!
//! Trackers map `(domain, key)` to storage-node URLs; bytes move over
//! plain HTTP directly to and from the storage nodes.

pub mod protocol;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info};

use super::{FileBackend, CHUNK_PREFIX};
use crate::{ByteSink, ByteSource, FileStoreError, FileStoreResult, TrackerConfig};

pub use protocol::{TrackerClient, TrackerReply};

/// One write destination handed out by `create_open`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Destination {
    fid: String,
    devid: String,
    path: String,
}

impl Destination {
    fn from_reply(locator: &str, reply: &HashMap<String, String>) -> FileStoreResult<Self> {
        let fid = reply.get("fid").cloned();
        // multi_dest replies number their destinations; take the first
        let devid = reply.get("devid_1").or_else(|| reply.get("devid")).cloned();
        let path = reply.get("path_1").or_else(|| reply.get("path")).cloned();

        match (fid, devid, path) {
            (Some(fid), Some(devid), Some(path)) => Ok(Self { fid, devid, path }),
            _ => Err(FileStoreError::backend_message(
                "create_open",
                locator,
                "tracker reply is missing fid, devid or path",
            )),
        }
    }
}

pub struct TrackerBackend {
    config: TrackerConfig,
    tracker: TrackerClient,
    http: reqwest::Client,
    read_quantum: usize,
}

impl TrackerBackend {
    /// Fails fast with `Configuration` when any option is missing
    pub fn new(config: TrackerConfig, read_quantum: usize) -> FileStoreResult<Self> {
        config.validate()?;
        let tracker = TrackerClient::new(config.hosts.clone());
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| FileStoreError::configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            tracker,
            http,
            read_quantum: read_quantum.max(1),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn class_for(&self, locator: &str) -> &str {
        if locator.starts_with(&format!("{}_", CHUNK_PREFIX)) {
            &self.config.chunk_class
        } else {
            &self.config.file_class
        }
    }

    fn domain(&self) -> String {
        self.config.domain.clone()
    }

    /// Every storage-node URL the tracker reports for `locator`
    pub async fn paths(&self, locator: &str) -> FileStoreResult<Vec<String>> {
        let reply = self
            .tracker
            .call_ok(
                "get_paths",
                locator,
                &[("domain", self.domain()), ("key", locator.to_string()), ("noverify", "1".into())],
            )
            .await?;

        let count = reply
            .get("paths")
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        Ok((1..=count)
            .filter_map(|i| reply.get(&format!("path{}", i)).cloned())
            .collect())
    }

    async fn first_http_url(&self, locator: &str) -> FileStoreResult<String> {
        self.paths(locator)
            .await?
            .into_iter()
            .find(|p| p.starts_with("http://"))
            .ok_or_else(|| FileStoreError::not_found(locator))
    }

    /// Spool a source of unknown length to scratch storage so its size can
    /// be declared to the storage node.
    async fn spool(&self, locator: &str, mut source: ByteSource) -> FileStoreResult<(ByteSource, u64)> {
        let scratch = tempfile::tempfile().map_err(|e| FileStoreError::io("spool", locator, e))?;
        let mut scratch = tokio::fs::File::from_std(scratch);
        let mut size = 0u64;
        while let Some(piece) = source.next_quantum(self.read_quantum).await? {
            scratch
                .write_all(&piece)
                .await
                .map_err(|e| FileStoreError::io("spool", locator, e))?;
            size += piece.len() as u64;
        }
        source.finish().await?;
        scratch.flush().await.map_err(|e| FileStoreError::io("spool", locator, e))?;
        scratch
            .seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| FileStoreError::io("spool", locator, e))?;
        Ok((ByteSource::reader(scratch).with_size(size), size))
    }
}

#[async_trait]
impl FileBackend for TrackerBackend {
    fn name(&self) -> &'static str {
        "Tracker"
    }

    fn read_quantum(&self) -> usize {
        self.read_quantum
    }

    async fn exists(&self, locator: &str) -> FileStoreResult<bool> {
        match self.paths(locator).await {
            Ok(paths) => Ok(!paths.is_empty()),
            Err(FileStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, locator: &str, source: ByteSource) -> FileStoreResult<u64> {
        let (source, size) = match source.size() {
            Some(size) => (source, size),
            None => self.spool(locator, source).await?,
        };
        if size == 0 {
            return Err(FileStoreError::invalid(format!(
                "cannot store zero-byte object '{}' in a tracker-backed store",
                locator
            )));
        }

        let class = self.class_for(locator).to_string();
        let reply = self
            .tracker
            .call_ok(
                "create_open",
                locator,
                &[
                    ("domain", self.domain()),
                    ("key", locator.to_string()),
                    ("class", class),
                    ("fid", "0".into()),
                    ("multi_dest", "1".into()),
                ],
            )
            .await?;
        let destination = Destination::from_reply(locator, &reply)?;
        debug!("writing '{}' to {}", locator, destination.path);

        let written = crate::http::put_from_source(&self.http, &destination.path, source, size, self.read_quantum).await?;

        self.tracker
            .call_ok(
                "create_close",
                locator,
                &[
                    ("domain", self.domain()),
                    ("key", locator.to_string()),
                    ("fid", destination.fid.clone()),
                    ("devid", destination.devid.clone()),
                    ("path", destination.path.clone()),
                    ("size", written.to_string()),
                ],
            )
            .await?;

        if !self.exists(locator).await? {
            error!("'{}' missing right after it was stored", locator);
            return Err(FileStoreError::backend_message(
                "put",
                locator,
                "object not visible after create_close",
            ));
        }
        info!("stored {} bytes at '{}'", written, locator);
        Ok(written)
    }

    async fn stream_to(&self, locator: &str, sink: &mut dyn ByteSink) -> FileStoreResult<()> {
        let url = self.first_http_url(locator).await?;
        crate::http::fetch_to_sink(&self.http, &url, self.read_quantum, sink).await?;
        Ok(())
    }

    async fn delete(&self, locator: &str) -> FileStoreResult<()> {
        let result = self
            .tracker
            .call_ok("delete", locator, &[("domain", self.domain()), ("key", locator.to_string())])
            .await;
        match result {
            Ok(_) => {
                info!("deleted '{}'", locator);
                Ok(())
            }
            Err(FileStoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rename(&self, old_locator: &str, new_locator: &str) -> FileStoreResult<()> {
        self.tracker
            .call_ok(
                "rename",
                old_locator,
                &[
                    ("domain", self.domain()),
                    ("from_key", old_locator.to_string()),
                    ("to_key", new_locator.to_string()),
                ],
            )
            .await?;
        info!("renamed '{}' to '{}'", old_locator, new_locator);
        Ok(())
    }

    fn http_client(&self) -> reqwest::Client {
        self.http.clone()
    }

    async fn copy(&self, from_locator: &str, to_locator: &str, expected_size: u64) -> FileStoreResult<()> {
        let url = self.forwardable_url(from_locator).await?;
        self.copy_from_url(to_locator, &url, expected_size).await
    }

    async fn forwardable_url(&self, locator: &str) -> FileStoreResult<String> {
        self.first_http_url(locator).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrackerConfig {
        TrackerConfig::new(vec!["127.0.0.1:7001".into()], "docs", "file", "chunk")
    }

    #[test]
    fn chunks_and_files_use_their_own_class() {
        let backend = TrackerBackend::new(config(), 1024).unwrap();
        assert_eq!(backend.class_for("chunk_report_3"), "chunk");
        assert_eq!(backend.class_for("report"), "file");
        assert_eq!(backend.class_for("chunky"), "file");
    }

    #[test]
    fn every_option_is_required() {
        let mut missing_domain = config();
        missing_domain.domain.clear();
        assert!(matches!(
            TrackerBackend::new(missing_domain, 1024),
            Err(FileStoreError::Configuration { .. })
        ));
    }

    #[test]
    fn destinations_prefer_numbered_entries() {
        let reply: HashMap<String, String> = [
            ("fid", "12"),
            ("dev_count", "2"),
            ("devid_1", "3"),
            ("path_1", "http://a/dev3/12.fid"),
            ("devid_2", "4"),
            ("path_2", "http://b/dev4/12.fid"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let destination = Destination::from_reply("doc", &reply).unwrap();
        assert_eq!(destination.devid, "3");
        assert_eq!(destination.path, "http://a/dev3/12.fid");
        assert!(Destination::from_reply("doc", &HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn zero_byte_objects_are_refused() {
        let backend = TrackerBackend::new(config(), 1024).unwrap();
        assert!(matches!(
            backend.put("empty", ByteSource::from("")).await,
            Err(FileStoreError::Invalid { .. })
        ));
    }
}
