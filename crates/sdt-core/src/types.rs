use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Which way bytes move relative to the local filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// Terminal state of one run of a transfer job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// Every part confirmed and the object/file committed
    Completed,
    /// Stopped early; a checkpoint lets a later run continue
    Resumable,
    /// Permanently failed; remote and local partial output cleaned up
    Aborted,
}

/// What a caller gets back from `upload`/`download`.
#[derive(Debug)]
pub struct TransferResult {
    pub job_id: String,
    pub direction: Direction,
    pub outcome: TransferOutcome,
    /// Plaintext bytes confirmed by this job (including parts confirmed by
    /// earlier runs of the same job)
    pub bytes_transferred: u64,
    /// Number of parts confirmed when the run ended
    pub confirmed_parts: usize,
    /// Highest part number confirmed, for resume-vs-restart decisions
    pub last_confirmed_part: Option<u32>,
    /// Path of the persisted checkpoint when `outcome == Resumable`
    pub resume_token: Option<String>,
    pub error: Option<TransferError>,
}

impl TransferResult {
    pub fn success(&self) -> bool {
        self.outcome == TransferOutcome::Completed
    }
}
