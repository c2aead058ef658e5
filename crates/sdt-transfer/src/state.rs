//! Job checkpoints: which parts of a plan the service has acknowledged.
//!
//! One JSON file per job under the state directory, named by job id and
//! replaced atomically (write temp, then rename) on every update. A part is
//! only recorded after the service returned its receipt, so a checkpoint
//! never claims more than was committed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sdt_core::Direction;
use sdt_storage::PartReceipt;

use crate::planner::PlannedPart;

pub const CHECKPOINT_VERSION: u32 = 1;

/// What an interrupted upload needs to produce identical parts again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    pub upload_id: String,
    /// Container header, base64
    pub header: String,
    /// Data key sealed to the resume recipient, base64; absent when the
    /// job had no local identity to reseal with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    pub version: u32,
    pub job_id: String,
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_key: String,
    /// Plaintext size of the file
    pub plaintext_len: u64,
    /// Full part plan; a resume is only valid against the identical plan
    pub parts: Vec<PlannedPart>,
    /// Acknowledged parts, sorted by part number
    pub confirmed: Vec<PartReceipt>,
    /// Plaintext bytes provably committed: the prefix covered by confirmed
    /// parts 1..=k with no gap
    pub committed_offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadCheckpoint>,
    /// blake3 of the container header a download was started against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_digest: Option<String>,
    /// Unix timestamp of the last update
    pub updated_at: u64,
}

impl TransferState {
    pub fn new(
        job_id: &str,
        direction: Direction,
        local_path: &Path,
        remote_key: &str,
        plaintext_len: u64,
        parts: Vec<PlannedPart>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            job_id: job_id.to_string(),
            direction,
            local_path: local_path.to_path_buf(),
            remote_key: remote_key.to_string(),
            plaintext_len,
            parts,
            confirmed: Vec::new(),
            committed_offset: 0,
            upload: None,
            header_digest: None,
            updated_at: now_secs(),
        }
    }

    /// Record an acknowledged part. Re-confirming replaces the receipt.
    pub fn confirm(&mut self, receipt: PartReceipt) {
        match self
            .confirmed
            .binary_search_by_key(&receipt.part_number, |r| r.part_number)
        {
            Ok(i) => self.confirmed[i] = receipt,
            Err(i) => self.confirmed.insert(i, receipt),
        }
        self.committed_offset = self.contiguous_offset();
        self.updated_at = now_secs();
    }

    /// Drop confirmations the caller could not validate.
    pub fn retain_confirmed<F: FnMut(&PartReceipt) -> bool>(&mut self, keep: F) {
        self.confirmed.retain(keep);
        self.committed_offset = self.contiguous_offset();
    }

    pub fn is_confirmed(&self, part_number: u32) -> bool {
        self.receipt(part_number).is_some()
    }

    pub fn receipt(&self, part_number: u32) -> Option<&PartReceipt> {
        self.confirmed
            .binary_search_by_key(&part_number, |r| r.part_number)
            .ok()
            .map(|i| &self.confirmed[i])
    }

    /// Parts still to transfer, in plan order.
    pub fn pending(&self) -> Vec<PlannedPart> {
        self.parts
            .iter()
            .filter(|p| !self.is_confirmed(p.number))
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(|p| self.is_confirmed(p.number))
    }

    /// Highest confirmed part number.
    pub fn last_confirmed(&self) -> Option<u32> {
        self.confirmed.last().map(|r| r.part_number)
    }

    /// Plaintext bytes in confirmed parts.
    pub fn confirmed_bytes(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| self.is_confirmed(p.number))
            .map(|p| p.plaintext_len)
            .sum()
    }

    /// Whether this checkpoint was written for exactly `parts`.
    pub fn matches_plan(&self, plaintext_len: u64, parts: &[PlannedPart]) -> bool {
        self.version == CHECKPOINT_VERSION
            && self.plaintext_len == plaintext_len
            && self.parts == parts
    }

    fn contiguous_offset(&self) -> u64 {
        self.parts
            .iter()
            .take_while(|p| self.is_confirmed(p.number))
            .last()
            .map(|p| p.plaintext_end())
            .unwrap_or(0)
    }
}

/// Directory of job checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    /// Load a job's checkpoint, if one exists.
    pub fn load(&self, job_id: &str) -> Result<Option<TransferState>> {
        let path = self.path(job_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading checkpoint: {}", path.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("parsing checkpoint: {}", path.display()))?;
        Ok(Some(state))
    }

    /// Persist using an atomic write (write then rename).
    pub fn save(&self, state: &TransferState) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating state dir: {}", self.dir.display()))?;

        let path = self.path(&state.job_id);
        let json = serde_json::to_string_pretty(state).context("serializing checkpoint")?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing checkpoint temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming checkpoint: {}", path.display()))?;
        Ok(path)
    }

    /// Remove a job's checkpoint; missing is fine.
    pub fn discard(&self, job_id: &str) -> Result<()> {
        let path = self.path(job_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing checkpoint: {}", path.display())),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
