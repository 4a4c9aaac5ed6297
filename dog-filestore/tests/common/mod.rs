#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use dog_filestore::backend::tracker::protocol::decode_args;
use dog_filestore::{ByteSink, ByteSource, FileBackend, FileStoreError, FileStoreResult, InMemoryBackend};

/// Objects held by the mock storage node, by file name
pub type NodeObjects = Arc<Mutex<HashMap<String, Bytes>>>;

/// HTTP storage node: GET and PUT under `/dev1/{file}`, plus
/// `/chunked/{file}` which serves the same bytes with chunked encoding.
pub struct StorageNode {
    pub base_url: String,
    pub objects: NodeObjects,
}

pub async fn storage_node() -> StorageNode {
    let objects: NodeObjects = Arc::new(Mutex::new(HashMap::new()));

    async fn fetch(State(objects): State<NodeObjects>, Path(file): Path<String>) -> Response {
        let found = objects.lock().get(&file).cloned();
        match found {
            Some(data) => (StatusCode::OK, data).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn store(State(objects): State<NodeObjects>, Path(file): Path<String>, body: Bytes) -> StatusCode {
        objects.lock().insert(file, body);
        StatusCode::CREATED
    }

    async fn fetch_chunked(State(objects): State<NodeObjects>, Path(file): Path<String>) -> Response {
        let found = objects.lock().get(&file).cloned();
        let Some(data) = found else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let pieces: Vec<Result<Bytes, std::io::Error>> = data
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Body::from_stream(futures::stream::iter(pieces)).into_response()
    }

    let app = Router::new()
        .route("/dev1/{file}", get(fetch).put(store))
        .route("/chunked/{file}", get(fetch_chunked))
        .layer(DefaultBodyLimit::disable())
        .with_state(objects.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StorageNode { base_url, objects }
}

/// Key to storage-node URL, as the mock tracker sees it
pub type TrackerKeys = Arc<Mutex<HashMap<String, String>>>;

pub struct MockTracker {
    pub addr: String,
    pub keys: TrackerKeys,
    pub classes: Arc<Mutex<HashMap<String, String>>>,
}

/// Tracker speaking the line protocol against one storage node
pub async fn mock_tracker(node_url: &str) -> MockTracker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let keys: TrackerKeys = Arc::new(Mutex::new(HashMap::new()));
    let classes = Arc::new(Mutex::new(HashMap::new()));
    let next_fid = Arc::new(AtomicU64::new(1));

    let node_url = node_url.to_string();
    let state = (keys.clone(), classes.clone());
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (keys, classes) = state.clone();
            let next_fid = next_fid.clone();
            let node_url = node_url.clone();
            tokio::spawn(async move {
                let mut stream = BufReader::new(stream);
                let mut line = String::new();
                while stream.read_line(&mut line).await.unwrap_or(0) > 0 {
                    let reply = answer(&line, &keys, &classes, &next_fid, &node_url);
                    if stream.get_mut().write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                    line.clear();
                }
            });
        }
    });

    MockTracker { addr, keys, classes }
}

fn encode(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn answer(
    line: &str,
    keys: &TrackerKeys,
    classes: &Arc<Mutex<HashMap<String, String>>>,
    next_fid: &AtomicU64,
    node_url: &str,
) -> String {
    let line = line.trim_end();
    let (command, raw) = line.split_once(' ').unwrap_or((line, ""));
    let args = decode_args(raw);
    let arg = |name: &str| args.get(name).cloned().unwrap_or_default();
    const UNKNOWN: &str = "ERR unknown_key unknown_key\r\n";

    match command {
        "create_open" => {
            let fid = next_fid.fetch_add(1, Ordering::SeqCst);
            classes.lock().insert(arg("key"), arg("class"));
            let path = format!("{}/dev1/{}.fid", node_url, fid);
            format!(
                "OK {}\r\n",
                encode(&[
                    ("fid", fid.to_string()),
                    ("dev_count", "1".into()),
                    ("devid_1", "1".into()),
                    ("path_1", path),
                ])
            )
        }
        "create_close" => {
            keys.lock().insert(arg("key"), arg("path"));
            "OK \r\n".to_string()
        }
        "get_paths" => match keys.lock().get(&arg("key")) {
            Some(path) => format!("OK {}\r\n", encode(&[("paths", "1".into()), ("path1", path.clone())])),
            None => UNKNOWN.to_string(),
        },
        "delete" => match keys.lock().remove(&arg("key")) {
            Some(_) => "OK \r\n".to_string(),
            None => UNKNOWN.to_string(),
        },
        "rename" => {
            let mut keys = keys.lock();
            match keys.remove(&arg("from_key")) {
                Some(path) => {
                    keys.insert(arg("to_key"), path);
                    "OK \r\n".to_string()
                }
                None => UNKNOWN.to_string(),
            }
        }
        _ => "ERR unknown_command unknown+command\r\n".to_string(),
    }
}

/// In-memory backend whose reads of one locator fail with an I/O error
pub struct FailingReads {
    pub inner: InMemoryBackend,
    pub poisoned: String,
}

#[async_trait]
impl FileBackend for FailingReads {
    fn name(&self) -> &'static str {
        "FailingReads"
    }

    fn read_quantum(&self) -> usize {
        self.inner.read_quantum()
    }

    async fn exists(&self, locator: &str) -> FileStoreResult<bool> {
        self.inner.exists(locator).await
    }

    async fn put(&self, locator: &str, source: ByteSource) -> FileStoreResult<u64> {
        self.inner.put(locator, source).await
    }

    async fn stream_to(&self, locator: &str, sink: &mut dyn ByteSink) -> FileStoreResult<()> {
        if locator == self.poisoned {
            return Err(FileStoreError::io(
                "stream",
                locator,
                std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
            ));
        }
        self.inner.stream_to(locator, sink).await
    }

    async fn delete(&self, locator: &str) -> FileStoreResult<()> {
        self.inner.delete(locator).await
    }

    async fn rename(&self, old_locator: &str, new_locator: &str) -> FileStoreResult<()> {
        self.inner.rename(old_locator, new_locator).await
    }
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
