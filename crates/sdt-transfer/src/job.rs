//! Job description and the immutable per-job configuration.

use std::path::{Path, PathBuf};

use sdt_core::config::{SdtConfig, TransferConfig};
use sdt_core::Direction;
use sdt_crypto::keys::{Identity, Recipient};

use crate::planner::PartLimits;
use crate::retry::RetryPolicy;

/// Tunables for one transfer. Built once and passed in; never global.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Minimum part size in bytes (the planner may grow it)
    pub part_size: u64,
    /// Parts in flight at once
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub limits: PartLimits,
    /// Checkpoint directory
    pub state_dir: PathBuf,
    /// Continue from a matching checkpoint instead of starting over
    pub resume: bool,
    /// Allow a download to replace an existing local file
    pub force_overwrite: bool,
}

impl JobConfig {
    pub fn from_config(cfg: &TransferConfig) -> Self {
        Self {
            part_size: cfg.part_size_bytes(),
            concurrency: cfg.concurrency.max(1),
            retry: RetryPolicy::from_config(cfg),
            limits: PartLimits::default(),
            state_dir: cfg.state_dir.clone(),
            resume: true,
            force_overwrite: false,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self::from_config(&SdtConfig::default().transfer)
    }
}

/// Keys a job may need: recipients to seal new containers to, identities to
/// open existing ones (and to reseal upload checkpoints).
#[derive(Clone, Default)]
pub struct KeyMaterial {
    pub recipients: Vec<Recipient>,
    pub identities: Vec<Identity>,
}

impl KeyMaterial {
    pub fn new(recipients: Vec<Recipient>, identities: Vec<Identity>) -> Self {
        Self {
            recipients,
            identities,
        }
    }

    /// Public half of the first local identity. Upload checkpoints seal the
    /// data key to it so an interrupted upload can re-encode identical parts.
    pub fn resume_recipient(&self) -> Option<Recipient> {
        self.identities.first().map(|i| i.to_public())
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("recipients", &self.recipients.len())
            .field("identities", &self.identities.len())
            .finish()
    }
}

/// One invocation's transfer, fixed once planning starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_key: String,
    /// Plaintext bytes (upload) or container bytes (download)
    pub size: u64,
    /// Seconds since the epoch of the source's last modification, when known
    pub source_mtime: u64,
    pub part_size: u64,
    pub concurrency: usize,
}

impl TransferJob {
    /// Stable identifier: the same parameters always give the same id, so a
    /// rerun finds the previous run's checkpoint.
    pub fn id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.direction.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.local_path.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.remote_key.as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.size.to_le_bytes());
        hasher.update(&self.source_mtime.to_le_bytes());
        hasher.update(&self.part_size.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        hex[..24].to_string()
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }
}
