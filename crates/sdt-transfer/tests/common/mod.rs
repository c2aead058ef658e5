//! Shared fixtures: in-memory store, throwaway keys, and a store wrapper that
//! injects failures.
#![allow(dead_code)]

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;

use sdt_core::{SdtResult, TransferError};
use sdt_crypto::keys::Identity;
use sdt_storage::{MultipartStore, OpendalStore, PartReceipt};
use sdt_transfer::{JobConfig, KeyMaterial, PartLimits, RetryPolicy};

pub fn memory_store() -> OpendalStore {
    let op = Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish();
    OpendalStore::new(op)
}

pub fn keys() -> KeyMaterial {
    let identity = Identity::generate();
    KeyMaterial::new(vec![identity.to_public()], vec![identity])
}

/// Small parts and near-instant retries.
pub fn job_config(state_dir: &Path, part_size: u64, concurrency: usize) -> JobConfig {
    JobConfig {
        part_size,
        concurrency,
        retry: RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
        limits: PartLimits::default(),
        state_dir: state_dir.to_path_buf(),
        resume: true,
        force_overwrite: false,
    }
}

/// Deterministic, non-repeating test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub fn write_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write test file");
    path
}

fn transient(what: &str) -> TransferError {
    TransferError::Network {
        retryable: true,
        message: format!("injected timeout: {what}"),
    }
}

/// Wraps a store, failing or corrupting selected calls.
pub struct FaultyStore {
    inner: OpendalStore,
    /// part number -> remaining transient put failures (u32::MAX = forever)
    put_failures: Mutex<HashMap<u32, u32>>,
    /// parts whose puts are refused with 403
    denied_puts: Mutex<Vec<u32>>,
    /// added latency per put
    put_delay: Mutex<Duration>,
    /// range start -> remaining corrupted reads
    corrupt_reads: Mutex<HashMap<u64, u32>>,
    /// range start -> remaining transient read failures
    read_failures: Mutex<HashMap<u64, u32>>,
    /// part numbers of every put_part call, in call order
    pub put_calls: Mutex<Vec<u32>>,
    /// range starts of every get_range call, in call order
    pub read_calls: Mutex<Vec<u64>>,
    pub aborted: Mutex<Vec<String>>,
}

impl FaultyStore {
    pub fn new(inner: OpendalStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            put_failures: Mutex::default(),
            denied_puts: Mutex::default(),
            put_delay: Mutex::new(Duration::ZERO),
            corrupt_reads: Mutex::default(),
            read_failures: Mutex::default(),
            put_calls: Mutex::default(),
            read_calls: Mutex::default(),
            aborted: Mutex::default(),
        })
    }

    pub fn fail_put(&self, part: u32, times: u32) {
        self.put_failures.lock().unwrap().insert(part, times);
    }

    pub fn deny_put(&self, part: u32) {
        self.denied_puts.lock().unwrap().push(part);
    }

    pub fn delay_puts(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = delay;
    }

    pub fn corrupt_read(&self, range_start: u64, times: u32) {
        self.corrupt_reads.lock().unwrap().insert(range_start, times);
    }

    pub fn fail_read(&self, range_start: u64, times: u32) {
        self.read_failures.lock().unwrap().insert(range_start, times);
    }

    pub fn clear_faults(&self) {
        self.put_failures.lock().unwrap().clear();
        self.denied_puts.lock().unwrap().clear();
        self.corrupt_reads.lock().unwrap().clear();
        self.read_failures.lock().unwrap().clear();
    }

    pub fn reset_calls(&self) {
        self.put_calls.lock().unwrap().clear();
        self.read_calls.lock().unwrap().clear();
    }

    fn take(map: &Mutex<HashMap<u64, u32>>, key: u64) -> bool {
        let mut map = map.lock().unwrap();
        match map.get_mut(&key) {
            Some(0) | None => false,
            Some(n) => {
                if *n != u32::MAX {
                    *n -= 1;
                }
                true
            }
        }
    }
}

#[async_trait]
impl MultipartStore for FaultyStore {
    async fn create_multipart(&self, key: &str) -> SdtResult<String> {
        self.inner.create_multipart(key).await
    }

    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> SdtResult<PartReceipt> {
        self.put_calls.lock().unwrap().push(part_number);
        let delay = *self.put_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.denied_puts.lock().unwrap().contains(&part_number) {
            return Err(TransferError::Service {
                code: 403,
                message: format!("injected denial: put part {part_number}"),
            });
        }
        let fail = {
            let mut failures = self.put_failures.lock().unwrap();
            match failures.get_mut(&part_number) {
                Some(0) | None => false,
                Some(n) => {
                    if *n != u32::MAX {
                        *n -= 1;
                    }
                    true
                }
            }
        };
        if fail {
            return Err(transient(&format!("put part {part_number}")));
        }
        self.inner.put_part(key, upload_id, part_number, data).await
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> SdtResult<Vec<PartReceipt>> {
        self.inner.list_parts(key, upload_id).await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartReceipt],
    ) -> SdtResult<()> {
        self.inner.complete_multipart(key, upload_id, parts).await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> SdtResult<()> {
        self.aborted.lock().unwrap().push(upload_id.to_string());
        self.inner.abort_multipart(key, upload_id).await
    }

    async fn object_size(&self, key: &str) -> SdtResult<u64> {
        self.inner.object_size(key).await
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> SdtResult<Bytes> {
        self.read_calls.lock().unwrap().push(range.start);
        if Self::take(&self.read_failures, range.start) {
            return Err(transient(&format!("read at {}", range.start)));
        }
        let data = self.inner.get_range(key, range.clone()).await?;
        if Self::take(&self.corrupt_reads, range.start) {
            let mut bad = data.to_vec();
            if let Some(b) = bad.last_mut() {
                *b ^= 0xFF;
            }
            return Ok(Bytes::from(bad));
        }
        Ok(data)
    }

    async fn put_object(&self, key: &str, data: Bytes) -> SdtResult<()> {
        self.inner.put_object(key, data).await
    }

    async fn get_object(&self, key: &str) -> SdtResult<Option<Bytes>> {
        self.inner.get_object(key).await
    }

    async fn delete_object(&self, key: &str) -> SdtResult<()> {
        self.inner.delete_object(key).await
    }
}
