pub mod config;
pub mod error;
pub mod types;

pub use error::{ErrorClass, SdtResult, TransferError};
pub use types::{Direction, TransferOutcome, TransferResult};
