//! Part workers: bounded-concurrency put/get of single parts with retry and
//! checksum verification.
//!
//! `WorkerPool` owns the concurrency limit. A caller acquires a permit, then
//! spawns the part's work with it; the permit comes back with the outcome
//! so the caller decides when the slot frees up (an upload releases it at
//! once, a download keeps it until the part has been decoded, which bounds
//! the reorder buffer).

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use sdt_core::{ErrorClass, SdtResult, TransferError};
use sdt_storage::{part_checksum, MultipartStore, PartReceipt};

use crate::planner::PlannedPart;
use crate::progress::ProgressTracker;
use crate::retry::{RetryDecision, RetryPolicy};

/// Result of one part's work, with the permit it ran under.
pub struct PartOutcome<T> {
    pub part: PlannedPart,
    pub result: SdtResult<T>,
    pub permit: OwnedSemaphorePermit,
}

/// Concurrency slots of a `WorkerPool`.
#[derive(Clone)]
pub struct Slots(Arc<Semaphore>);

impl Slots {
    pub async fn acquire(&self) -> SdtResult<OwnedSemaphorePermit> {
        self.0
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Cancelled)
    }
}

pub struct WorkerPool<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<PartOutcome<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
        }
    }

    /// Handle for waiting on a free slot while the pool itself is borrowed
    /// for `next()`.
    pub fn slots(&self) -> Slots {
        Slots(self.permits.clone())
    }

    pub fn spawn<F>(&mut self, permit: OwnedSemaphorePermit, part: PlannedPart, work: F)
    where
        F: Future<Output = SdtResult<T>> + Send + 'static,
    {
        self.tasks.spawn(async move {
            let result = work.await;
            PartOutcome {
                part,
                result,
                permit,
            }
        });
    }

    /// Next finished part, in completion order. `None` when nothing is in
    /// flight.
    pub async fn next(&mut self) -> Option<SdtResult<PartOutcome<T>>> {
        let joined = self.tasks.join_next().await?;
        Some(joined.map_err(|e| {
            TransferError::Io(std::io::Error::other(format!("part task failed: {e}")))
        }))
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Performs single-part operations against the store, retrying per policy.
#[derive(Clone)]
pub struct PartWorker {
    store: Arc<dyn MultipartStore>,
    policy: RetryPolicy,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
}

impl PartWorker {
    pub fn new(
        store: Arc<dyn MultipartStore>,
        policy: RetryPolicy,
        progress: Arc<ProgressTracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            policy,
            progress,
            cancel,
        }
    }

    /// Put one encoded part and verify the store's receipt against it. On
    /// success the part's plaintext bytes count as confirmed.
    pub async fn upload(
        &self,
        key: &str,
        upload_id: &str,
        part: &PlannedPart,
        data: Bytes,
    ) -> SdtResult<PartReceipt> {
        let expected = part_checksum(&data);
        let sent = data.len() as u64;
        let number = part.number;
        let store = &self.store;
        let expected_ref = expected.as_str();

        let receipt = self
            .with_retry(number, "upload", || {
                let data = data.clone();
                async move {
                    let receipt = store.put_part(key, upload_id, number, data).await?;
                    if receipt.size != sent {
                        return Err(TransferError::ChecksumMismatch {
                            part: number,
                            expected: format!("{sent} bytes"),
                            actual: format!("{} bytes", receipt.size),
                        });
                    }
                    if receipt.etag != expected_ref {
                        return Err(TransferError::ChecksumMismatch {
                            part: number,
                            expected: expected_ref.to_string(),
                            actual: receipt.etag,
                        });
                    }
                    Ok(receipt)
                }
            })
            .await?;

        self.progress.record_confirmed(number, part.plaintext_len);
        debug!(key = %key, part = number, bytes = sent, "part confirmed");
        Ok(receipt)
    }

    /// Fetch one part's byte range, checking its length and, when known,
    /// its checksum.
    pub async fn fetch(
        &self,
        key: &str,
        part: &PlannedPart,
        checksum: Option<&str>,
    ) -> SdtResult<Bytes> {
        let number = part.number;
        let range = part.range.clone();
        let expected_len = part.len();
        let store = &self.store;

        let data = self
            .with_retry(number, "download", || {
                let range = range.clone();
                async move {
                    let data = store.get_range(key, range).await?;
                    if data.len() as u64 != expected_len {
                        return Err(TransferError::ChecksumMismatch {
                            part: number,
                            expected: format!("{expected_len} bytes"),
                            actual: format!("{} bytes", data.len()),
                        });
                    }
                    if let Some(expected) = checksum {
                        let actual = part_checksum(&data);
                        if actual != expected {
                            return Err(TransferError::ChecksumMismatch {
                                part: number,
                                expected: expected.to_string(),
                                actual,
                            });
                        }
                    }
                    Ok(data)
                }
            })
            .await?;

        self.progress.observe_read(number, part.plaintext_len);
        debug!(key = %key, part = number, bytes = data.len(), "part fetched");
        Ok(data)
    }

    /// Run `attempt_once` until it succeeds or the policy gives up. Part 0
    /// labels operations that belong to the whole object.
    pub(crate) async fn with_retry<T, F, Fut>(
        &self,
        part: u32,
        what: &str,
        mut attempt_once: F,
    ) -> SdtResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SdtResult<T>>,
    {
        let mut attempt = 0u32;
        let mut checksum_failures = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            attempt += 1;
            let err = match attempt_once().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if err.class() == ErrorClass::Checksum {
                checksum_failures += 1;
            }

            match self.policy.decide(&err, attempt, checksum_failures) {
                RetryDecision::Retry(delay) => {
                    warn!(part, attempt, delay_ms = delay.as_millis() as u64, "{what} failed, retrying: {err}");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => {
                    error!(part, attempt, "{what} failed: {err}");
                    return Err(err);
                }
            }
        }
    }
}
