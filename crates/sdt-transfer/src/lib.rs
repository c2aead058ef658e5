//! sdt-transfer: encrypted multipart transfer engine
//!
//! `TransferOrchestrator` drives one job end to end: plan block-aligned
//! parts, encode or decode through the container codec, move parts through
//! a bounded worker pool with retry, checkpoint every confirmed part, and
//! finish as completed, resumable, or aborted.

pub mod job;
pub mod manifest;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod state;
pub mod worker;

pub use job::{JobConfig, KeyMaterial, TransferJob};
pub use orchestrator::TransferOrchestrator;
pub use planner::{PartLimits, PartPlanner, PlannedPart};
pub use progress::{ProgressSample, ProgressTracker};
pub use retry::RetryPolicy;
pub use state::{CheckpointStore, TransferState};
