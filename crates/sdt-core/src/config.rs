use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest part size the archive accepts, in MiB. Smaller hints are raised
/// to this value.
pub const MIN_PART_SIZE_MB: u64 = 15;

/// Top-level configuration (loaded from sdt.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SdtConfig {
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub keys: KeysConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3 endpoint, with or without scheme (e.g. inbox.example.org:443)
    pub endpoint: String,
    /// Prefix scheme-less endpoints with https:// (http:// otherwise)
    pub use_https: bool,
    /// S3 region; the archive ignores it but the signer needs one
    pub region: String,
    /// Bucket name; empty means "the account identifier" (access key)
    pub bucket: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
    /// Per network call timeout in seconds
    pub socket_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Part size hint in MiB (raised to MIN_PART_SIZE_MB when smaller)
    pub part_size_mb: u64,
    /// Parallel part transfers per job
    pub concurrency: usize,
    /// Attempts per part before a retryable error becomes terminal
    pub max_attempts: u32,
    /// First retry delay in milliseconds (doubles per attempt)
    pub retry_base_ms: u64,
    /// Upper bound for a single retry delay in milliseconds
    pub retry_max_ms: u64,
    /// Directory for job checkpoints
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// age recipient files (public keys) every upload is sealed to
    pub recipients: Vec<PathBuf>,
    /// Local age identity file (private key) for downloads and upload resume
    pub identity: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: warn)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8333".into(),
            use_https: true,
            region: "us-west-2".into(),
            bucket: String::new(),
            enforce_tls: false,
            socket_timeout_secs: 30,
        }
    }
}

impl StorageConfig {
    /// Endpoint URL with an explicit scheme.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            self.endpoint.clone()
        } else if self.use_https {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }

    /// Bucket to address, falling back to the account identifier.
    pub fn bucket_for(&self, access_key: &str) -> String {
        if self.bucket.is_empty() {
            access_key.to_string()
        } else {
            self.bucket.clone()
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size_mb: MIN_PART_SIZE_MB,
            concurrency: 5,
            max_attempts: 5,
            retry_base_ms: 200,
            retry_max_ms: 10_000,
            state_dir: PathBuf::from("~/.local/share/sdt/jobs"),
        }
    }
}

impl TransferConfig {
    /// Part size in bytes after applying the archive minimum.
    pub fn part_size_bytes(&self) -> u64 {
        self.part_size_mb.max(MIN_PART_SIZE_MB) * 1024 * 1024
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            format: "text".into(),
        }
    }
}
