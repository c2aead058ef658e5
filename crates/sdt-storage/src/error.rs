//! Classification of OpenDAL errors into the transfer error taxonomy

use opendal::ErrorKind;
use sdt_core::TransferError;

/// Map an OpenDAL error to a `TransferError`, keeping `what` as context.
///
/// Throttling becomes a 429 service error, temporary failures (timeouts,
/// connection resets, 5xx responses) become retryable network errors, and
/// access/lookup failures become non-retryable 4xx service errors.
pub fn classify(e: opendal::Error, what: &str) -> TransferError {
    let message = format!("{what}: {e}");
    match e.kind() {
        ErrorKind::RateLimited => TransferError::Service { code: 429, message },
        ErrorKind::PermissionDenied => TransferError::Service { code: 403, message },
        ErrorKind::NotFound => TransferError::Service { code: 404, message },
        ErrorKind::ConditionNotMatch => TransferError::Service { code: 412, message },
        ErrorKind::RangeNotSatisfied => TransferError::Service { code: 416, message },
        ErrorKind::ConfigInvalid | ErrorKind::Unsupported => TransferError::Config(message),
        _ if e.is_temporary() => TransferError::Network {
            retryable: true,
            message,
        },
        _ => TransferError::Network {
            retryable: false,
            message,
        },
    }
}
