use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{FileStoreError, FileStoreResult};

/// Default maximum bytes moved by a single read or write (1 MiB)
pub const DEFAULT_READ_QUANTUM: usize = 1_048_576;

/// Default chunk size used to derive the chunk count of a transfer
pub const DEFAULT_CHUNK_SIZE: u64 = 4096;

/// Configuration for the storage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum bytes per I/O call on every streaming path
    pub read_quantum: usize,

    /// Chunk size used to compute `total_chunks` for a declared transfer
    pub chunk_size: u64,

    /// Deployment environment; the in-memory backend is refused in "production"
    pub environment: String,

    /// Which backend to construct
    pub backend: BackendConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_quantum: DEFAULT_READ_QUANTUM,
            chunk_size: DEFAULT_CHUNK_SIZE,
            environment: "development".to_string(),
            backend: BackendConfig::InMemory,
        }
    }
}

/// Backend selection and its options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Objects live as plain files under `base_path`
    FileSystem { base_path: PathBuf },
    /// Objects live in a tracker-coordinated HTTP object store
    Tracker(TrackerConfig),
    /// Objects live in process memory (non-production only)
    InMemory,
}

/// Options for the distributed, tracker-addressed object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Tracker addresses as `host:port`
    pub hosts: Vec<String>,
    /// Logical namespace every key lives in
    pub domain: String,
    /// Storage class for whole objects
    pub file_class: String,
    /// Storage class for chunk objects
    pub chunk_class: String,
}

impl TrackerConfig {
    pub fn new<D, F, C>(hosts: Vec<String>, domain: D, file_class: F, chunk_class: C) -> Self
    where
        D: Into<String>,
        F: Into<String>,
        C: Into<String>,
    {
        Self {
            hosts,
            domain: domain.into(),
            file_class: file_class.into(),
            chunk_class: chunk_class.into(),
        }
    }

    /// Every option is required
    pub fn validate(&self) -> FileStoreResult<()> {
        fn missing(option: &str) -> FileStoreError {
            FileStoreError::configuration(format!(
                "cannot initialize tracker backend: configuration option '{}' missing",
                option
            ))
        }

        if self.hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(missing("hosts"));
        }
        if self.domain.trim().is_empty() {
            return Err(missing("domain"));
        }
        if self.file_class.trim().is_empty() {
            return Err(missing("file_class"));
        }
        if self.chunk_class.trim().is_empty() {
            return Err(missing("chunk_class"));
        }
        Ok(())
    }
}

impl StoreConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read quantum
    pub fn with_read_quantum(mut self, bytes: usize) -> Self {
        self.read_quantum = bytes;
        self
    }

    /// Set the chunk size used for chunk count derivation
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the deployment environment
    pub fn with_environment<S: Into<String>>(mut self, environment: S) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the backend
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Store objects under a directory
    pub fn file_system<P: Into<PathBuf>>(self, base_path: P) -> Self {
        self.with_backend(BackendConfig::FileSystem {
            base_path: base_path.into(),
        })
    }

    /// Store objects in a tracker-coordinated object store
    pub fn tracker(self, tracker: TrackerConfig) -> Self {
        self.with_backend(BackendConfig::Tracker(tracker))
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Check option values before any backend is constructed
    pub fn validate(&self) -> FileStoreResult<()> {
        if self.read_quantum == 0 {
            return Err(FileStoreError::configuration("read_quantum must be at least 1 byte"));
        }
        if self.chunk_size == 0 {
            return Err(FileStoreError::configuration("chunk_size must be at least 1 byte"));
        }
        match &self.backend {
            BackendConfig::FileSystem { base_path } if base_path.as_os_str().is_empty() => Err(
                FileStoreError::configuration("file_system backend requires a base_path"),
            ),
            BackendConfig::Tracker(tracker) => tracker.validate(),
            BackendConfig::InMemory if self.is_production() => Err(FileStoreError::configuration(
                "the in-memory backend is for testing only and is not allowed in production",
            )),
            _ => Ok(()),
        }
    }

    /// Parse a JSON document with the same shape as this struct
    pub fn from_json(json: &str) -> FileStoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `FILESTORE_*` environment variables
    pub fn from_env() -> FileStoreResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> FileStoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| FileStoreError::configuration(format!("{} environment variable required", key)))
        };

        let mut config = Self::default();

        if let Some(quantum) = lookup("FILESTORE_READ_QUANTUM") {
            config.read_quantum = quantum.trim().parse().map_err(|_| {
                FileStoreError::configuration(format!("FILESTORE_READ_QUANTUM is not a number: {}", quantum))
            })?;
        }
        if let Some(chunk_size) = lookup("FILESTORE_CHUNK_SIZE") {
            config.chunk_size = chunk_size.trim().parse().map_err(|_| {
                FileStoreError::configuration(format!("FILESTORE_CHUNK_SIZE is not a number: {}", chunk_size))
            })?;
        }
        if let Some(environment) = lookup("FILESTORE_ENV") {
            config.environment = environment;
        }

        let kind = required("FILESTORE_BACKEND")?;
        config.backend = match kind.trim() {
            "file_system" => BackendConfig::FileSystem {
                base_path: PathBuf::from(required("FILESTORE_PATH")?),
            },
            "tracker" => BackendConfig::Tracker(TrackerConfig {
                hosts: required("FILESTORE_TRACKER_HOSTS")?
                    .split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect(),
                domain: required("FILESTORE_TRACKER_DOMAIN")?,
                file_class: required("FILESTORE_TRACKER_FILE_CLASS")?,
                chunk_class: required("FILESTORE_TRACKER_CHUNK_CLASS")?,
            }),
            "in_memory" => BackendConfig::InMemory,
            other => {
                return Err(FileStoreError::configuration(format!(
                    "unknown FILESTORE_BACKEND '{}'",
                    other
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Number of chunks needed to carry `expected_size` bytes; never less than one
    pub fn chunks_for(&self, expected_size: u64) -> u32 {
        let chunks = expected_size.div_ceil(self.chunk_size.max(1));
        chunks.clamp(1, u32::MAX as u64) as u32
    }
}
