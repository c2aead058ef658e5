//! Byte-accurate progress shared by concurrent part workers.
//!
//! Confirmed bytes only move when a part is acknowledged, and each part is
//! counted at most once, so retries never inflate the total. Read progress
//! (bytes traversed by readers, before confirmation) is tracked separately
//! as a per-part high-water mark.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::SystemTime;

use tokio::sync::watch;

/// Point-in-time view of a job's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub timestamp: SystemTime,
    /// Plaintext bytes in confirmed parts; never decreases within a job
    pub confirmed_bytes: u64,
    /// Plaintext bytes traversed by readers, each offset counted once
    pub read_bytes: u64,
    /// Plaintext size of the job
    pub total_bytes: u64,
}

impl ProgressSample {
    fn empty(total_bytes: u64) -> Self {
        Self {
            timestamp: SystemTime::now(),
            confirmed_bytes: 0,
            read_bytes: 0,
            total_bytes,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.confirmed_bytes == self.total_bytes
    }
}

#[derive(Default)]
struct Counters {
    total: u64,
    counted: HashSet<u32>,
    confirmed: u64,
    read_marks: HashMap<u32, u64>,
    read: u64,
}

pub struct ProgressTracker {
    inner: Mutex<Counters>,
    tx: watch::Sender<ProgressSample>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        let (tx, _) = watch::channel(ProgressSample::empty(total_bytes));
        Self {
            inner: Mutex::new(Counters {
                total: total_bytes,
                ..Default::default()
            }),
            tx,
        }
    }

    /// Start a new job: forget all counted parts.
    pub fn reset(&self, total_bytes: u64) {
        let mut c = self.lock();
        *c = Counters {
            total: total_bytes,
            ..Default::default()
        };
        self.publish(&c);
    }

    /// Count `bytes` for `part` unless it was already counted. Returns
    /// whether this call changed the total.
    pub fn record_confirmed(&self, part: u32, bytes: u64) -> bool {
        let mut c = self.lock();
        if !c.counted.insert(part) {
            return false;
        }
        c.confirmed += bytes;
        // a confirmed part has been fully read, whatever readers reported
        let mark = c.read_marks.entry(part).or_insert(0);
        let unread = bytes.saturating_sub(*mark);
        *mark = bytes.max(*mark);
        c.read += unread;
        self.publish(&c);
        true
    }

    /// A reader reached `offset` bytes into `part`. Only the portion beyond
    /// the part's previous high-water mark counts; returns that portion.
    pub fn observe_read(&self, part: u32, offset: u64) -> u64 {
        let mut c = self.lock();
        let mark = c.read_marks.entry(part).or_insert(0);
        if offset <= *mark {
            return 0;
        }
        let delta = offset - *mark;
        *mark = offset;
        c.read += delta;
        self.publish(&c);
        delta
    }

    pub fn is_counted(&self, part: u32) -> bool {
        self.lock().counted.contains(&part)
    }

    pub fn snapshot(&self) -> ProgressSample {
        Self::sample(&self.lock())
    }

    /// Push-style view: the receiver sees every change after subscription.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSample> {
        self.tx.subscribe()
    }

    fn sample(c: &Counters) -> ProgressSample {
        ProgressSample {
            timestamp: SystemTime::now(),
            confirmed_bytes: c.confirmed,
            read_bytes: c.read,
            total_bytes: c.total,
        }
    }

    fn publish(&self, c: &Counters) {
        self.tx.send_replace(Self::sample(c));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
