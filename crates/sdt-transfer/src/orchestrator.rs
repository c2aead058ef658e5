//! End-to-end transfer of one file.
//!
//! Each job moves through `Init -> Planning -> InFlight -> Finalizing` and
//! ends `Completed`, `Resumable` or `Aborted`. The orchestrator is the only
//! writer of the job's `TransferState`: workers return receipts, and the
//! dispatch loop merges them and rewrites the checkpoint after each one.
//!
//! Upload: the local file is encoded part by part on a blocking thread (one
//! file cursor per job) and handed to the worker pool through a bounded
//! channel, so at most `concurrency + 1` encoded parts exist at a time.
//!
//! Download: parts are fetched concurrently, held in a reorder buffer
//! together with their pool permit, and decoded strictly in order. Only
//! verified plaintext is written, to `{local}.part`, which is renamed into
//! place once the final block has been verified.

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sdt_core::{Direction, SdtResult, TransferError, TransferOutcome, TransferResult};
use sdt_crypto::header::{Header, HEADER_PREFIX_LEN};
use sdt_crypto::{is_container, seal_key, unseal_key, Decoder, Encoder, MAGIC};
use sdt_storage::{part_checksum, MultipartStore, PartReceipt};

use crate::job::{JobConfig, KeyMaterial, TransferJob};
use crate::manifest::{manifest_key, PartManifest};
use crate::planner::{PartPlanner, PlannedPart};
use crate::progress::ProgressTracker;
use crate::state::{CheckpointStore, TransferState, UploadCheckpoint};
use crate::worker::{PartWorker, Slots, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Planning,
    InFlight,
    Finalizing,
    Completed,
    Resumable,
    Aborted,
}

/// Bookkeeping for one run of a job.
struct Run {
    direction: Direction,
    job_id: String,
    phase: Phase,
}

impl Run {
    fn new(direction: Direction) -> Self {
        let run = Self {
            direction,
            job_id: String::new(),
            phase: Phase::Init,
        };
        debug!(direction = %direction, phase = ?run.phase, "job phase");
        run
    }

    fn enter(&mut self, phase: Phase) {
        debug!(job_id = %self.job_id, direction = %self.direction, from = ?self.phase, phase = ?phase, "job phase");
        self.phase = phase;
    }

    fn result(
        &self,
        outcome: TransferOutcome,
        state: Option<&TransferState>,
        resume_token: Option<PathBuf>,
        error: Option<TransferError>,
    ) -> TransferResult {
        TransferResult {
            job_id: self.job_id.clone(),
            direction: self.direction,
            outcome,
            bytes_transferred: state.map(|s| s.confirmed_bytes()).unwrap_or(0),
            confirmed_parts: state.map(|s| s.confirmed.len()).unwrap_or(0),
            last_confirmed_part: state.and_then(|s| s.last_confirmed()),
            resume_token: resume_token.map(|p| p.display().to_string()),
            error,
        }
    }

    /// Failure before anything remote or local was created.
    fn failed_early(mut self, error: TransferError) -> TransferResult {
        self.enter(Phase::Aborted);
        error!(job_id = %self.job_id, direction = %self.direction, "transfer aborted: {error}");
        self.result(TransferOutcome::Aborted, None, None, Some(error))
    }
}

/// Runs transfer jobs against one store with one configuration.
pub struct TransferOrchestrator {
    store: Arc<dyn MultipartStore>,
    config: JobConfig,
    keys: KeyMaterial,
    planner: PartPlanner,
    checkpoints: CheckpointStore,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
}

impl TransferOrchestrator {
    pub fn new(store: Arc<dyn MultipartStore>, config: JobConfig, keys: KeyMaterial) -> Self {
        let planner = PartPlanner::new(config.limits.max_part_size);
        let checkpoints = CheckpointStore::new(&config.state_dir);
        Self {
            store,
            config,
            keys,
            planner,
            checkpoints,
            progress: Arc::new(ProgressTracker::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Progress of the current job; poll with `snapshot()` or push with
    /// `subscribe()`.
    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    /// Cancelling stops new dispatch, lets in-flight parts settle and ends
    /// the job `Aborted`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    fn worker(&self) -> PartWorker {
        PartWorker::new(
            self.store.clone(),
            self.config.retry,
            self.progress.clone(),
            self.cancel.clone(),
        )
    }

    fn save_checkpoint(&self, state: &TransferState) -> SdtResult<PathBuf> {
        self.checkpoints.save(state).map_err(checkpoint_error)
    }

    fn discard_checkpoint(&self, job_id: &str) {
        if let Err(e) = self.checkpoints.discard(job_id) {
            warn!(job_id = %job_id, "failed to remove checkpoint: {e:#}");
        }
    }

    // ── Upload ───────────────────────────────────────────────────────────────

    /// Encrypt `local_path` and upload it as `remote_key`.
    pub async fn upload(&self, local_path: &Path, remote_key: &str) -> TransferResult {
        let mut run = Run::new(Direction::Upload);

        let job = match self.prepare_upload(local_path, remote_key) {
            Ok(job) => job,
            Err(e) => return run.failed_early(e),
        };
        run.job_id = job.id();
        info!(job_id = %run.job_id, key = %remote_key, bytes = job.size, "upload started");

        run.enter(Phase::Planning);
        let resumed = match self.resume_upload(&job, &run.job_id).await {
            Ok(resumed) => resumed,
            Err(e) => return run.failed_early(e),
        };
        let (encoder, mut state) = match resumed {
            Some(resumed) => resumed,
            None => match self.start_upload(&job, &run.job_id).await {
                Ok(started) => started,
                Err(e) => return run.failed_early(e),
            },
        };

        run.enter(Phase::InFlight);
        let failure = self.upload_parts(&job, encoder.clone(), &mut state).await;

        let failure = match failure {
            None if state.is_complete() => {
                run.enter(Phase::Finalizing);
                match self.finish_upload(&job, &encoder, &state).await {
                    Ok(()) => {
                        run.enter(Phase::Completed);
                        self.discard_checkpoint(&run.job_id);
                        info!(job_id = %run.job_id, key = %remote_key, parts = state.confirmed.len(), "upload completed");
                        return run.result(TransferOutcome::Completed, Some(&state), None, None);
                    }
                    Err(e) => e,
                }
            }
            None => TransferError::Integrity(format!(
                "{} of {} parts confirmed after dispatch ended",
                state.confirmed.len(),
                state.parts.len()
            )),
            Some(e) => e,
        };

        let resumable = !failure.is_permanent()
            && state
                .upload
                .as_ref()
                .is_some_and(|u| u.resume_key.is_some());
        if resumable {
            if let Ok(path) = self.save_checkpoint(&state) {
                run.enter(Phase::Resumable);
                warn!(job_id = %run.job_id, last_part = ?state.last_confirmed(), "upload interrupted, resumable: {failure}");
                return run.result(TransferOutcome::Resumable, Some(&state), Some(path), Some(failure));
            }
        }

        run.enter(Phase::Aborted);
        if let Some(upload) = &state.upload {
            if let Err(e) = self.store.abort_multipart(&job.remote_key, &upload.upload_id).await {
                warn!(job_id = %run.job_id, "abort of multipart upload failed: {e}");
            }
        }
        self.discard_checkpoint(&run.job_id);
        error!(job_id = %run.job_id, last_part = ?state.last_confirmed(), "upload aborted: {failure}");
        run.result(TransferOutcome::Aborted, Some(&state), None, Some(failure))
    }

    /// Init: the source must be a regular file of known size that is not
    /// already a container.
    fn prepare_upload(&self, local_path: &Path, remote_key: &str) -> SdtResult<TransferJob> {
        let meta = std::fs::metadata(local_path)?;
        if !meta.is_file() {
            return Err(TransferError::SizeUnknown(local_path.display().to_string()));
        }
        if self.keys.recipients.is_empty() {
            return Err(TransferError::Config(
                "no recipients configured to encrypt for".into(),
            ));
        }

        let mut magic = [0u8; MAGIC.len()];
        let mut file = std::fs::File::open(local_path)?;
        let n = read_up_to(&mut file, &mut magic)?;
        if is_container(&magic[..n]) {
            return Err(TransferError::Config(format!(
                "{} is already encrypted",
                local_path.display()
            )));
        }

        let source_mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(TransferJob {
            direction: Direction::Upload,
            local_path: std::fs::canonicalize(local_path)?,
            remote_key: remote_key.to_string(),
            size: meta.len(),
            source_mtime,
            part_size: self.config.part_size,
            concurrency: self.config.concurrency,
        })
    }

    /// Planning for a fresh upload: new data key, plan, multipart upload id,
    /// initial checkpoint.
    async fn start_upload(
        &self,
        job: &TransferJob,
        job_id: &str,
    ) -> SdtResult<(Arc<Encoder>, TransferState)> {
        let encoder = Encoder::new(&self.keys.recipients, job.size)?;
        let parts = self.planner.plan_container(
            encoder.layout(),
            job.part_size,
            self.config.limits.max_part_count,
        )?;
        debug!(job_id = %job_id, parts = parts.len(), "planned upload");

        let worker = self.worker();
        let upload_id = worker
            .with_retry(0, "create multipart upload", || {
                self.store.create_multipart(&job.remote_key)
            })
            .await?;

        let resume_key = match self.keys.resume_recipient() {
            Some(recipient) => Some(B64.encode(seal_key(encoder.data_key(), &[recipient])?)),
            None => None,
        };

        let mut state = TransferState::new(
            job_id,
            Direction::Upload,
            &job.local_path,
            &job.remote_key,
            job.size,
            parts,
        );
        state.upload = Some(UploadCheckpoint {
            upload_id,
            header: B64.encode(encoder.header_bytes()),
            resume_key,
        });
        self.save_checkpoint(&state)?;
        Ok((Arc::new(encoder), state))
    }

    /// Planning for a rerun: reuse a matching checkpoint, or clear out a
    /// stale one (aborting its multipart upload) and return `None`.
    async fn resume_upload(
        &self,
        job: &TransferJob,
        job_id: &str,
    ) -> SdtResult<Option<(Arc<Encoder>, TransferState)>> {
        let state = match self.checkpoints.load(job_id) {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(job_id = %job_id, "discarding unreadable checkpoint: {e:#}");
                self.discard_checkpoint(job_id);
                return Ok(None);
            }
        };

        let reopened = if self.config.resume {
            self.reopen_upload(job, &state)
        } else {
            Err("restart requested".to_string())
        };

        let (encoder, mut state) = match reopened {
            Ok(encoder) => (encoder, state),
            Err(reason) => {
                warn!(job_id = %job_id, "discarding checkpoint: {reason}");
                if let Some(upload) = &state.upload {
                    if let Err(e) = self.store.abort_multipart(&state.remote_key, &upload.upload_id).await {
                        warn!(job_id = %job_id, "abort of stale multipart upload failed: {e}");
                    }
                }
                self.discard_checkpoint(job_id);
                return Ok(None);
            }
        };

        // Only trust parts the service still holds with the recorded checksum.
        let upload_id = state
            .upload
            .as_ref()
            .map(|u| u.upload_id.clone())
            .unwrap_or_default();
        let stored = self
            .worker()
            .with_retry(0, "list parts", || {
                self.store.list_parts(&job.remote_key, &upload_id)
            })
            .await?;
        let before = state.confirmed.len();
        state.retain_confirmed(|r| stored.iter().any(|s| s == r));
        if state.confirmed.len() != before {
            warn!(
                job_id = %job_id,
                dropped = before - state.confirmed.len(),
                "checkpointed parts missing from the service, re-uploading them"
            );
        }
        info!(
            job_id = %job_id,
            confirmed = state.confirmed.len(),
            pending = state.parts.len() - state.confirmed.len(),
            "resuming upload"
        );
        Ok(Some((Arc::new(encoder), state)))
    }

    /// Rebuild the encoder a checkpoint was written with, checking the plan
    /// it recorded is the one this job would make.
    fn reopen_upload(&self, job: &TransferJob, state: &TransferState) -> Result<Encoder, String> {
        let upload = match (&state.direction, &state.upload) {
            (Direction::Upload, Some(upload)) => upload,
            _ => return Err("not an upload checkpoint".into()),
        };
        let sealed = match &upload.resume_key {
            Some(sealed) => B64.decode(sealed).map_err(|e| format!("resume key: {e}"))?,
            None => return Err("no resume key (no local identity at upload time)".into()),
        };
        if self.keys.identities.is_empty() {
            return Err("no local identity to unseal the resume key".into());
        }
        let key = unseal_key(&sealed, &self.keys.identities).map_err(|e| e.to_string())?;
        let header = B64.decode(&upload.header).map_err(|e| format!("header: {e}"))?;
        let encoder = Encoder::resume(key, &header).map_err(|e| e.to_string())?;

        let parts = self
            .planner
            .plan_container(
                encoder.layout(),
                job.part_size,
                self.config.limits.max_part_count,
            )
            .map_err(|e| e.to_string())?;
        if !state.matches_plan(job.size, &parts) {
            return Err("part plan changed".into());
        }
        Ok(encoder)
    }

    /// InFlight for uploads. Returns the first terminal error, if any.
    async fn upload_parts(
        &self,
        job: &TransferJob,
        encoder: Arc<Encoder>,
        state: &mut TransferState,
    ) -> Option<TransferError> {
        let upload_id = state
            .upload
            .as_ref()
            .map(|u| u.upload_id.clone())
            .unwrap_or_default();

        self.progress.reset(job.size);
        for part in &state.parts {
            if state.is_confirmed(part.number) {
                self.progress.record_confirmed(part.number, part.plaintext_len);
            }
        }

        let pending = state.pending();
        let (tx, mut rx) = mpsc::channel(1);
        let producer = {
            let path = job.local_path.clone();
            let cancel = self.cancel.clone();
            let progress = self.progress.clone();
            let pending = pending.clone();
            tokio::task::spawn_blocking(move || {
                encode_parts(&encoder, &path, pending, &tx, &cancel, &progress)
            })
        };

        let worker = self.worker();
        let mut pool: WorkerPool<PartReceipt> = WorkerPool::new(self.config.concurrency);
        let slots = pool.slots();
        let mut failure: Option<TransferError> = None;
        let mut producing = !pending.is_empty();

        loop {
            let dispatching = failure.is_none() && producing;
            if !dispatching && pool.is_idle() {
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if dispatching => {
                    info!(job_id = %state.job_id, in_flight = pool.in_flight(), "upload cancelled, settling in-flight parts");
                    failure = Some(TransferError::Cancelled);
                }
                Some(done) = pool.next() => {
                    let outcome = match done {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            failure.get_or_insert(e);
                            continue;
                        }
                    };
                    drop(outcome.permit);
                    match outcome.result {
                        Ok(receipt) => {
                            state.confirm(receipt);
                            if let Err(e) = self.save_checkpoint(state) {
                                failure.get_or_insert(e);
                            }
                        }
                        Err(e) => {
                            failure.get_or_insert(e);
                        }
                    }
                }
                next = next_encoded(&slots, &mut rx), if dispatching => match next {
                    None => producing = false,
                    Some(Err(e)) => {
                        failure = Some(e);
                    }
                    Some(Ok((permit, part, data))) => {
                        let worker = worker.clone();
                        let key = job.remote_key.clone();
                        let upload_id = upload_id.clone();
                        let planned = part.clone();
                        pool.spawn(permit, part, async move {
                            worker.upload(&key, &upload_id, &planned, data).await
                        });
                    }
                },
            }
        }

        drop(rx);
        if let Err(e) = producer.await {
            failure.get_or_insert(TransferError::Io(std::io::Error::other(format!(
                "encoder task failed: {e}"
            ))));
        }
        failure
    }

    /// Finalizing for uploads: assemble the object and write its part
    /// manifest.
    async fn finish_upload(
        &self,
        job: &TransferJob,
        encoder: &Encoder,
        state: &TransferState,
    ) -> SdtResult<()> {
        let upload_id = state
            .upload
            .as_ref()
            .map(|u| u.upload_id.clone())
            .unwrap_or_default();
        let worker = self.worker();
        worker
            .with_retry(0, "complete multipart upload", || {
                self.store
                    .complete_multipart(&job.remote_key, &upload_id, &state.confirmed)
            })
            .await?;

        let with_sums: Vec<(PlannedPart, String)> = state
            .parts
            .iter()
            .filter_map(|p| state.receipt(p.number).map(|r| (p.clone(), r.etag.clone())))
            .collect();
        let manifest = PartManifest::new(encoder.layout(), job.part_size, &with_sums);
        let body = Bytes::from(manifest.to_bytes()?);
        let key = manifest_key(&job.remote_key);
        if let Err(e) = worker
            .with_retry(0, "write part manifest", || {
                self.store.put_object(&key, body.clone())
            })
            .await
        {
            // the object is complete; downloads fall back to length checks
            warn!(key = %key, "part manifest not written: {e}");
        }
        Ok(())
    }

    // ── Download ─────────────────────────────────────────────────────────────

    /// Download `remote_key` and decrypt it into `local_path`.
    pub async fn download(&self, remote_key: &str, local_path: &Path) -> TransferResult {
        let mut run = Run::new(Direction::Download);

        let opened = match self.open_download(remote_key, local_path).await {
            Ok(opened) => opened,
            Err(e) => return run.failed_early(e),
        };
        let OpenedDownload {
            job,
            mut decoder,
            header_digest,
        } = opened;
        run.job_id = job.id();
        info!(job_id = %run.job_id, key = %remote_key, bytes = job.size, "download started");

        run.enter(Phase::Planning);
        let plan = match self.plan_download(&job, &decoder).await {
            Ok(plan) => plan,
            Err(e) => return run.failed_early(e),
        };
        let partial = partial_path(local_path);
        let mut state = self.resume_download(&job, &run.job_id, &plan, &partial, &header_digest);
        let parts: Vec<PlannedPart> = plan.iter().map(|(p, _)| p.clone()).collect();
        if let Some(next) = parts.iter().find(|p| !state.is_confirmed(p.number)) {
            decoder.seek_block(next.first_block);
        } else {
            decoder.seek_block(decoder.layout().block_count());
        }

        let mut file = match open_partial(&partial, state.committed_offset).await {
            Ok(file) => file,
            Err(e) => return run.failed_early(e),
        };

        run.enter(Phase::InFlight);
        let failure = self
            .download_parts(&job, &plan, &mut decoder, &mut state, &mut file)
            .await;

        let failure = match failure {
            None => {
                run.enter(Phase::Finalizing);
                match finish_download(file, &decoder, &partial, local_path).await {
                    Ok(()) => {
                        run.enter(Phase::Completed);
                        self.discard_checkpoint(&run.job_id);
                        info!(job_id = %run.job_id, path = %local_path.display(), "download completed");
                        return run.result(TransferOutcome::Completed, Some(&state), None, None);
                    }
                    Err(e) => e,
                }
            }
            Some(e) => {
                drop(file);
                e
            }
        };

        // Only the verified prefix may remain on disk.
        if let Err(e) = truncate_partial(&partial, state.committed_offset).await {
            warn!(path = %partial.display(), "failed to truncate partial output: {e}");
        }

        if !failure.is_permanent() {
            if let Ok(path) = self.save_checkpoint(&state) {
                run.enter(Phase::Resumable);
                warn!(job_id = %run.job_id, last_part = ?state.last_confirmed(), "download interrupted, resumable: {failure}");
                return run.result(TransferOutcome::Resumable, Some(&state), Some(path), Some(failure));
            }
        }

        run.enter(Phase::Aborted);
        self.discard_checkpoint(&run.job_id);
        error!(job_id = %run.job_id, last_part = ?state.last_confirmed(), "download aborted: {failure}");
        run.result(TransferOutcome::Aborted, Some(&state), None, Some(failure))
    }

    /// Init for downloads: refuse to clobber, read the header by range and
    /// unseal the data key before any part is fetched.
    async fn open_download(&self, remote_key: &str, local_path: &Path) -> SdtResult<OpenedDownload> {
        if local_path.exists() && !self.config.force_overwrite {
            return Err(TransferError::Config(format!(
                "{} exists; pass force_overwrite to replace it",
                local_path.display()
            )));
        }
        if self.keys.identities.is_empty() {
            return Err(TransferError::Config(
                "no identity configured to decrypt with".into(),
            ));
        }

        let worker = self.worker();
        let size = worker
            .with_retry(0, "stat object", || self.store.object_size(remote_key))
            .await?;

        let prefix_len = (HEADER_PREFIX_LEN as u64).min(size);
        let prefix = worker
            .with_retry(0, "read header", || {
                self.store.get_range(remote_key, 0..prefix_len)
            })
            .await?;
        let (_, header_len) = Header::parse_prefix(&prefix)?;
        if header_len > size {
            return Err(TransferError::Format(format!(
                "object is {size} bytes, shorter than its {header_len}-byte header"
            )));
        }
        let header = worker
            .with_retry(0, "read header", || {
                self.store.get_range(remote_key, 0..header_len)
            })
            .await?;
        let decoder = Decoder::from_header_bytes(&self.keys.identities, &header)?;
        let header_digest = blake3::hash(&header).to_hex().to_string();

        let expected = decoder.layout().total_len();
        if expected != size {
            return Err(TransferError::Integrity(format!(
                "object is {size} bytes but its header describes {expected}"
            )));
        }

        let job = TransferJob {
            direction: Direction::Download,
            local_path: absolute(local_path)?,
            remote_key: remote_key.to_string(),
            size,
            source_mtime: 0,
            part_size: self.config.part_size,
            concurrency: self.config.concurrency,
        };
        Ok(OpenedDownload {
            job,
            decoder,
            header_digest,
        })
    }

    /// Reproduce the upload's plan from its part manifest when there is one,
    /// else plan from the object size with length checks only.
    async fn plan_download(
        &self,
        job: &TransferJob,
        decoder: &Decoder,
    ) -> SdtResult<Vec<(PlannedPart, Option<String>)>> {
        let layout = decoder.layout();
        let key = manifest_key(&job.remote_key);
        let manifest = self
            .worker()
            .with_retry(0, "read part manifest", || self.store.get_object(&key))
            .await?;

        if let Some(bytes) = manifest {
            match PartManifest::from_bytes(&bytes).and_then(|m| m.plan(layout)) {
                Ok(plan) => {
                    debug!(key = %job.remote_key, parts = plan.len(), "planned download from part manifest");
                    return Ok(plan.into_iter().map(|(p, sum)| (p, Some(sum))).collect());
                }
                Err(e) => warn!(key = %key, "ignoring part manifest: {e}"),
            }
        }

        let parts =
            self.planner
                .plan_container(layout, job.part_size, self.config.limits.max_part_count)?;
        debug!(key = %job.remote_key, parts = parts.len(), "planned download from object size");
        Ok(parts.into_iter().map(|p| (p, None)).collect())
    }

    /// Reuse a checkpoint taken against the same object header whose plan
    /// matches and whose partial output still holds the committed prefix;
    /// otherwise start clean.
    fn resume_download(
        &self,
        job: &TransferJob,
        job_id: &str,
        plan: &[(PlannedPart, Option<String>)],
        partial: &Path,
        header_digest: &str,
    ) -> TransferState {
        let parts: Vec<PlannedPart> = plan.iter().map(|(p, _)| p.clone()).collect();
        let plaintext_len: u64 = parts.iter().map(|p| p.plaintext_len).sum();
        let fresh = || {
            let mut state = TransferState::new(
                job_id,
                Direction::Download,
                &job.local_path,
                &job.remote_key,
                plaintext_len,
                parts.clone(),
            );
            state.header_digest = Some(header_digest.to_string());
            state
        };

        let state = match self.checkpoints.load(job_id) {
            Ok(Some(state)) => state,
            Ok(None) => return fresh(),
            Err(e) => {
                warn!(job_id = %job_id, "discarding unreadable checkpoint: {e:#}");
                self.discard_checkpoint(job_id);
                return fresh();
            }
        };

        let on_disk = std::fs::metadata(partial).map(|m| m.len()).unwrap_or(0);
        let reason = if !self.config.resume {
            Some("restart requested")
        } else if state.direction != Direction::Download
            || !state.matches_plan(plaintext_len, &parts)
        {
            Some("part plan changed")
        } else if state.header_digest.as_deref() != Some(header_digest) {
            Some("remote object was replaced")
        } else if on_disk < state.committed_offset {
            Some("partial output shorter than checkpoint")
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(job_id = %job_id, "discarding checkpoint: {reason}");
            self.discard_checkpoint(job_id);
            return fresh();
        }

        let mut state = state;
        // decoding only ever commits a contiguous prefix
        let committed: Vec<u32> = parts
            .iter()
            .take_while(|p| state.is_confirmed(p.number))
            .map(|p| p.number)
            .collect();
        state.retain_confirmed(|r| committed.contains(&r.part_number));
        info!(
            job_id = %job_id,
            confirmed = state.confirmed.len(),
            offset = state.committed_offset,
            "resuming download"
        );
        state
    }

    /// InFlight for downloads. Returns the first terminal error, if any.
    async fn download_parts(
        &self,
        job: &TransferJob,
        plan: &[(PlannedPart, Option<String>)],
        decoder: &mut Decoder,
        state: &mut TransferState,
        file: &mut tokio::fs::File,
    ) -> Option<TransferError> {
        self.progress.reset(decoder.layout().plaintext_len);
        for (part, _) in plan {
            if state.is_confirmed(part.number) {
                self.progress.record_confirmed(part.number, part.plaintext_len);
            }
        }

        let header_len = decoder.layout().header_len;
        let mut queue: VecDeque<(PlannedPart, Option<String>)> = plan
            .iter()
            .filter(|(p, _)| !state.is_confirmed(p.number))
            .cloned()
            .collect();
        let mut expected: VecDeque<u32> = queue.iter().map(|(p, _)| p.number).collect();
        let mut ready: BTreeMap<u32, (PlannedPart, Bytes, OwnedSemaphorePermit)> = BTreeMap::new();

        let worker = self.worker();
        let mut pool: WorkerPool<Bytes> = WorkerPool::new(self.config.concurrency);
        let slots = pool.slots();
        let mut failure: Option<TransferError> = None;
        let mut decode_failed = false;

        loop {
            let dispatching = failure.is_none() && !queue.is_empty();
            if !dispatching && pool.is_idle() {
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if dispatching => {
                    info!(job_id = %state.job_id, in_flight = pool.in_flight(), "download cancelled, settling in-flight parts");
                    failure = Some(TransferError::Cancelled);
                }
                Some(done) = pool.next() => {
                    let outcome = match done {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            failure.get_or_insert(e);
                            continue;
                        }
                    };
                    match outcome.result {
                        Ok(data) => {
                            ready.insert(outcome.part.number, (outcome.part, data, outcome.permit));
                        }
                        Err(e) => {
                            failure.get_or_insert(e);
                        }
                    }
                    // Decode whatever is now contiguous, even after another
                    // part failed, so the verified prefix is as long as possible.
                    while !decode_failed {
                        let Some(next) = expected.front().copied() else { break };
                        let Some((part, data, permit)) = ready.remove(&next) else { break };
                        let committed = self
                            .commit_part(&part, &data, header_len, decoder, state, file)
                            .await;
                        drop(permit);
                        match committed {
                            Ok(()) => {
                                expected.pop_front();
                            }
                            Err(e) => {
                                decode_failed = true;
                                failure.get_or_insert(e);
                            }
                        }
                    }
                }
                permit = slots.acquire(), if dispatching => {
                    let permit = match permit {
                        Ok(permit) => permit,
                        Err(e) => {
                            failure = Some(e);
                            continue;
                        }
                    };
                    if let Some((part, checksum)) = queue.pop_front() {
                        let worker = worker.clone();
                        let key = job.remote_key.clone();
                        let planned = part.clone();
                        pool.spawn(permit, part, async move {
                            worker.fetch(&key, &planned, checksum.as_deref()).await
                        });
                    }
                }
            }
        }

        if failure.is_none() && !state.is_complete() {
            failure = Some(TransferError::Integrity(format!(
                "{} of {} parts decoded after dispatch ended",
                state.confirmed.len(),
                state.parts.len()
            )));
        }
        failure
    }

    /// Decrypt one fetched part, append its plaintext and checkpoint it.
    async fn commit_part(
        &self,
        part: &PlannedPart,
        data: &Bytes,
        header_len: u64,
        decoder: &mut Decoder,
        state: &mut TransferState,
        file: &mut tokio::fs::File,
    ) -> SdtResult<()> {
        let skip = if part.range.start == 0 { header_len as usize } else { 0 };
        if decoder.next_block() != part.first_block {
            return Err(TransferError::Integrity(format!(
                "part {} starts at block {}, decoder expects {}",
                part.number,
                part.first_block,
                decoder.next_block()
            )));
        }
        let plaintext = decoder.decrypt_run(&data[skip.min(data.len())..])?;
        file.write_all(&plaintext).await?;

        state.confirm(PartReceipt {
            part_number: part.number,
            etag: part_checksum(data),
            size: data.len() as u64,
        });
        self.progress.record_confirmed(part.number, part.plaintext_len);
        self.save_checkpoint(state)?;
        debug!(job_id = %state.job_id, part = part.number, bytes = plaintext.len(), "part decoded");
        Ok(())
    }
}

struct OpenedDownload {
    job: TransferJob,
    decoder: Decoder,
    header_digest: String,
}

/// Acquire a pool slot, then take the next encoded part.
async fn next_encoded(
    slots: &Slots,
    rx: &mut mpsc::Receiver<SdtResult<(PlannedPart, Bytes)>>,
) -> Option<SdtResult<(OwnedSemaphorePermit, PlannedPart, Bytes)>> {
    let permit = match slots.acquire().await {
        Ok(permit) => permit,
        Err(e) => return Some(Err(e)),
    };
    match rx.recv().await? {
        Ok((part, data)) => Some(Ok((permit, part, data))),
        Err(e) => Some(Err(e)),
    }
}

/// Producer side of an upload: encode pending parts in plan order with a
/// single file cursor.
fn encode_parts(
    encoder: &Encoder,
    path: &Path,
    pending: Vec<PlannedPart>,
    tx: &mpsc::Sender<SdtResult<(PlannedPart, Bytes)>>,
    cancel: &CancellationToken,
    progress: &ProgressTracker,
) {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) => {
            let _ = tx.blocking_send(Err(e.into()));
            return;
        }
    };
    for part in pending {
        if cancel.is_cancelled() {
            return;
        }
        let encoded = encode_part(encoder, &mut file, &part);
        if encoded.is_ok() {
            progress.observe_read(part.number, part.plaintext_len);
        }
        let failed = encoded.is_err();
        if tx.blocking_send(encoded.map(|data| (part, data))).is_err() || failed {
            return;
        }
    }
}

fn encode_part(encoder: &Encoder, file: &mut std::fs::File, part: &PlannedPart) -> SdtResult<Bytes> {
    file.seek(SeekFrom::Start(part.plaintext_start))?;
    let mut data = Vec::with_capacity(part.len() as usize);
    if part.range.start == 0 {
        data.extend_from_slice(&encoder.header_bytes());
    }
    data.extend_from_slice(&encoder.encode_range(&mut *file, part.blocks())?);
    if data.len() as u64 != part.len() {
        return Err(TransferError::Integrity(format!(
            "part {} encoded to {} bytes, planned {}",
            part.number,
            data.len(),
            part.len()
        )));
    }
    Ok(Bytes::from(data))
}

fn read_up_to(source: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// `{local}.part`, next to the final file.
pub fn partial_path(local_path: &Path) -> PathBuf {
    let mut name = local_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn absolute(path: &Path) -> SdtResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

async fn open_partial(partial: &Path, committed: u64) -> SdtResult<tokio::fs::File> {
    if let Some(parent) = partial.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(partial)
        .await?;
    file.set_len(committed).await?;
    tokio::io::AsyncSeekExt::seek(&mut file, SeekFrom::Start(committed)).await?;
    Ok(file)
}

async fn truncate_partial(partial: &Path, committed: u64) -> std::io::Result<()> {
    if committed == 0 {
        return match tokio::fs::remove_file(partial).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }
    let file = tokio::fs::OpenOptions::new().write(true).open(partial).await?;
    file.set_len(committed).await?;
    file.sync_all().await
}

/// Finalizing for downloads: every block verified, then the partial file
/// takes the final name.
async fn finish_download(
    mut file: tokio::fs::File,
    decoder: &Decoder,
    partial: &Path,
    local_path: &Path,
) -> SdtResult<()> {
    decoder.finish()?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(partial, local_path).await?;
    Ok(())
}

fn checkpoint_error(e: anyhow::Error) -> TransferError {
    TransferError::Io(std::io::Error::other(format!("{e:#}")))
}
