//! Backoff policy for part-level retries.

use std::time::Duration;

use sdt_core::config::TransferConfig;
use sdt_core::{ErrorClass, TransferError};

/// Checksum mismatches get one retry regardless of `max_attempts`.
pub const CHECKSUM_RETRIES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per part, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &TransferConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry_base_ms),
            max_delay: Duration::from_millis(cfg.retry_max_ms),
        }
    }

    /// Backoff before attempt `failed_attempt + 1`: base * 2^(n-1), capped.
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Decide what to do after `failed_attempt` (1-based) failed with `error`.
    /// `checksum_failures` counts mismatches so far, including this one.
    pub fn decide(
        &self,
        error: &TransferError,
        failed_attempt: u32,
        checksum_failures: u32,
    ) -> RetryDecision {
        if failed_attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        match error.class() {
            ErrorClass::Retryable => RetryDecision::Retry(self.delay(failed_attempt)),
            ErrorClass::Checksum if checksum_failures <= CHECKSUM_RETRIES => {
                RetryDecision::Retry(self.delay(failed_attempt))
            }
            ErrorClass::Checksum | ErrorClass::Fatal => RetryDecision::GiveUp,
        }
    }
}
