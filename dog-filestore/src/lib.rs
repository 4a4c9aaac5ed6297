//! # dog-filestore: file storage engine for DogRS applications
//!
//! `dog-filestore` stores large binary payloads outside the primary record
//! store and tracks how complete and how intact they are.
//!
//! ## Key Features
//!
//! - **Pluggable backends**: local filesystem, a tracker-addressed HTTP object
//!   store, and an in-memory store for tests
//! - **Chunked transfers**: upload a file in independent numbered chunks, in any
//!   order and concurrently, then assemble it exactly once with size and
//!   content-hash validation
//! - **Streaming bridge**: turn a backend's push-style delivery into a
//!   pull-style reader without holding the whole object in memory
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_filestore::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> FileStoreResult<()> {
//! let store = FileStore::open(StoreConfig::default().with_chunk_size(5)).await?;
//!
//! // Declare 10 bytes, which arrive as two 5-byte chunks
//! store.incoming("greeting", 10).await?;
//! store.put_chunk("greeting", 2, "world").await?;
//! let outcome = store.put_chunk("greeting", 1, "hello").await?;
//! assert!(outcome.is_complete());
//!
//! let contents = store.get_contents("greeting").await?;
//! assert_eq!(contents.as_deref(), Some(&b"helloworld"[..]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │    FileStore     │  ← what services embed
//! ├──────────────────┤
//! │ TransferManager  │  ← chunk bookkeeping, assembly, rollback
//! ├──────────────────┤
//! │   FileBackend    │  ← byte storage primitives
//! └──────────────────┘
//! ```
//!
//! A backend only has to implement `put` and `stream_to` (plus `exists`,
//! `delete` and `rename`); reads, sizes, hashes, copies and chunk assembly
//! all have default implementations built on those two.

pub mod adapter;
pub mod backend;
pub mod bridge;
mod config;
mod error;
pub mod http;
mod manager;
mod receipt;
mod record_store;
pub mod sink;
mod transfer;
mod types;

// Re-export main types for clean API
pub use adapter::FileStore;
pub use backend::{open_backend, FileBackend, FileSystemBackend, InMemoryBackend, TrackerBackend};
pub use bridge::{BridgeReader, BridgeWriter, StreamBridge};
pub use config::{BackendConfig, StoreConfig, TrackerConfig, DEFAULT_CHUNK_SIZE, DEFAULT_READ_QUANTUM};
pub use error::{FileStoreError, FileStoreResult};
pub use manager::TransferManager;
pub use receipt::{ChunkOutcome, TransferProgress};
pub use record_store::MemoryTransferRecordStore;
pub use sink::ByteSink;
pub use transfer::{TransferRecord, TransferRecordStore, TransferState};
pub use types::{ByteSource, ByteStream, ContentHash};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ByteSink, ByteSource, ChunkOutcome, ContentHash, FileBackend, FileStore, FileStoreError,
        FileStoreResult, StoreConfig, StreamBridge, TransferState,
    };
}
