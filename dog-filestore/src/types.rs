use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{FileStoreError, FileStoreResult, StreamBridge};

/// Stream of bytes for object content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Algorithm-tagged digest of an object's bytes, rendered `"<alg>:<hex>"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub const SHA256: &'static str = "sha256";

    /// Tag a raw digest with its algorithm
    pub fn new(algorithm: &str, digest: &[u8]) -> Self {
        Self(format!("{}:{}", algorithm, hex::encode(digest)))
    }

    /// Parse an already tagged hash string
    pub fn parse<S: Into<String>>(tagged: S) -> FileStoreResult<Self> {
        let tagged = tagged.into();
        match tagged.split_once(':') {
            Some((alg, hex)) if !alg.is_empty() && !hex.is_empty() => Ok(Self(tagged)),
            _ => Err(FileStoreError::invalid(format!(
                "content hash '{}' is not of the form <algorithm>:<hex>",
                tagged
            ))),
        }
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(alg, _)| alg).unwrap_or("")
    }

    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContentHash {
    type Error = FileStoreError;

    fn try_from(tagged: String) -> FileStoreResult<Self> {
        Self::parse(tagged)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum SourceKind {
    Buffer(Bytes),
    Stream(ByteStream),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Bridge(StreamBridge),
}

/// Source of bytes for a `put`: an in-memory buffer or a producer of
/// bounded reads. Every producer is drained one read quantum at a time.
pub struct ByteSource {
    kind: SourceKind,
    pending: Option<Bytes>,
    size: Option<u64>,
}

impl ByteSource {
    /// Whole payload already in memory
    pub fn buffer<B: Into<Bytes>>(data: B) -> Self {
        let data = data.into();
        let size = Some(data.len() as u64);
        Self {
            kind: SourceKind::Buffer(data),
            pending: None,
            size,
        }
    }

    /// Pull bytes from a stream; items larger than the quantum are split
    pub fn stream(stream: ByteStream) -> Self {
        Self {
            kind: SourceKind::Stream(stream),
            pending: None,
            size: None,
        }
    }

    /// Pull bytes from an async reader
    pub fn reader<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> Self {
        Self {
            kind: SourceKind::Reader(Box::new(reader)),
            pending: None,
            size: None,
        }
    }

    /// Pull bytes from the consumer side of a streaming bridge
    pub fn bridge(bridge: StreamBridge) -> Self {
        Self {
            kind: SourceKind::Bridge(bridge),
            pending: None,
            size: None,
        }
    }

    /// Declare the total number of bytes this source will yield
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Total size when known up front
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// The whole payload, if this source is an in-memory buffer
    pub fn as_buffer(&self) -> Option<&Bytes> {
        match &self.kind {
            SourceKind::Buffer(data) => Some(data),
            _ => None,
        }
    }

    /// Next run of at most `quantum` bytes; `None` once exhausted
    pub async fn next_quantum(&mut self, quantum: usize) -> FileStoreResult<Option<Bytes>> {
        let quantum = quantum.max(1);

        if let Some(mut pending) = self.pending.take() {
            if pending.len() > quantum {
                let head = pending.split_to(quantum);
                self.pending = Some(pending);
                return Ok(Some(head));
            }
            return Ok(Some(pending));
        }

        match &mut self.kind {
            SourceKind::Buffer(data) => {
                if data.is_empty() {
                    return Ok(None);
                }
                let take = quantum.min(data.len());
                Ok(Some(data.split_to(take)))
            }
            SourceKind::Stream(stream) => loop {
                match stream.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(FileStoreError::io("read", "<stream>", e)),
                    Some(Ok(item)) if item.is_empty() => continue,
                    Some(Ok(mut item)) => {
                        if item.len() > quantum {
                            let head = item.split_to(quantum);
                            self.pending = Some(item);
                            return Ok(Some(head));
                        }
                        return Ok(Some(item));
                    }
                }
            },
            SourceKind::Reader(reader) => {
                let mut buf = vec![0u8; quantum];
                let read = reader
                    .read(&mut buf)
                    .await
                    .map_err(|e| FileStoreError::io("read", "<reader>", e))?;
                if read == 0 {
                    return Ok(None);
                }
                buf.truncate(read);
                Ok(Some(Bytes::from(buf)))
            }
            SourceKind::Bridge(bridge) => bridge.read(quantum).await,
        }
    }

    /// Drain the whole source into memory
    pub async fn collect(mut self, quantum: usize) -> FileStoreResult<Bytes> {
        if let SourceKind::Buffer(data) = &self.kind {
            if self.pending.is_none() {
                return Ok(data.clone());
            }
        }
        let mut out = bytes::BytesMut::new();
        while let Some(next) = self.next_quantum(quantum).await? {
            out.extend_from_slice(&next);
        }
        Ok(out.freeze())
    }

    /// Finish any producer behind this source, surfacing its failure
    pub async fn finish(self) -> FileStoreResult<()> {
        match self.kind {
            SourceKind::Bridge(bridge) => bridge.finish().await,
            _ => Ok(()),
        }
    }
}

impl From<Bytes> for ByteSource {
    fn from(data: Bytes) -> Self {
        Self::buffer(data)
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(data: Vec<u8>) -> Self {
        Self::buffer(data)
    }
}

impl From<&'static [u8]> for ByteSource {
    fn from(data: &'static [u8]) -> Self {
        Self::buffer(data)
    }
}

impl From<&'static str> for ByteSource {
    fn from(data: &'static str) -> Self {
        Self::buffer(data)
    }
}

impl From<String> for ByteSource {
    fn from(data: String) -> Self {
        Self::buffer(data)
    }
}

impl From<ByteStream> for ByteSource {
    fn from(stream: ByteStream) -> Self {
        Self::stream(stream)
    }
}
