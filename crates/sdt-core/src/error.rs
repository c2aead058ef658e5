use thiserror::Error;

pub type SdtResult<T> = Result<T, TransferError>;

/// Every way a transfer job can fail.
///
/// Part-level retryable variants (`Network { retryable: true }`, throttling
/// and 5xx `Service` codes) are normally absorbed by the worker's retry
/// policy and only reach the caller once attempts are exhausted.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("config error: {0}")]
    Config(String),

    #[error("cannot unseal data key: {0}")]
    KeyUnseal(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("container format error: {0}")]
    Format(String),

    #[error("planning error: {0}")]
    Planning(String),

    #[error("size of {0} cannot be determined before transfer")]
    SizeUnknown(String),

    #[error("network error: {message}")]
    Network { retryable: bool, message: String },

    #[error("service error {code}: {message}")]
    Service { code: u16, message: String },

    #[error("checksum mismatch on part {part}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        part: u32,
        expected: String,
        actual: String,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the retry policy should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, 5xx, throttling: retry with backoff.
    Retryable,
    /// Data did not match its checksum: retry once, then fatal.
    Checksum,
    /// Surface immediately.
    Fatal,
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Network { retryable, .. } => {
                if *retryable {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            TransferError::Service { code, .. } => {
                if is_retryable_status(*code) {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            TransferError::ChecksumMismatch { .. } => ErrorClass::Checksum,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// True when retrying the job later cannot help: bad input, bad
    /// credentials, or a cryptographic failure. Transient network trouble
    /// that merely outlasted the retry budget is not permanent.
    pub fn is_permanent(&self) -> bool {
        self.class() != ErrorClass::Retryable
    }

    /// Cryptographic failures; these never leave unverified output behind.
    pub fn is_cryptographic(&self) -> bool {
        matches!(
            self,
            TransferError::KeyUnseal(_) | TransferError::Integrity(_)
        )
    }
}

/// 408 request timeout, 429 throttling and every 5xx are worth retrying.
pub fn is_retryable_status(code: u16) -> bool {
    code == 408 || code == 429 || (500..=599).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_classification() {
        let throttled = TransferError::Service {
            code: 429,
            message: "SlowDown".into(),
        };
        let unavailable = TransferError::Service {
            code: 503,
            message: "ServiceUnavailable".into(),
        };
        let denied = TransferError::Service {
            code: 403,
            message: "AccessDenied".into(),
        };

        assert_eq!(throttled.class(), ErrorClass::Retryable);
        assert_eq!(unavailable.class(), ErrorClass::Retryable);
        assert_eq!(denied.class(), ErrorClass::Fatal);
        assert!(denied.is_permanent());
        assert!(!unavailable.is_permanent());
    }

    #[test]
    fn test_network_classification() {
        let timeout = TransferError::Network {
            retryable: true,
            message: "timed out".into(),
        };
        let refused = TransferError::Network {
            retryable: false,
            message: "invalid endpoint".into(),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_permanent());
        assert_eq!(refused.class(), ErrorClass::Fatal);
        assert!(refused.is_permanent());
    }

    #[test]
    fn test_checksum_and_crypto_classes() {
        let mismatch = TransferError::ChecksumMismatch {
            part: 2,
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(mismatch.class(), ErrorClass::Checksum);
        assert!(mismatch.is_permanent());

        let tampered = TransferError::Integrity("block 3".into());
        assert!(tampered.is_cryptographic());
        assert_eq!(tampered.class(), ErrorClass::Fatal);
    }
}
