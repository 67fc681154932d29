//! Duplicate-aware download coordinator
//!
//! Drives transfers through the host primitive with:
//! - Filename collision checks before the host binds a destination
//! - A one-time partial fingerprint check once enough bytes have arrived
//! - Correlation-id decisions (overwrite, rename, skip) for detected duplicates
//! - Fingerprint registration and history after completion
//! - Pause/Resume/Cancel and batch re-hash requests

pub mod commands;
mod decision;
mod types;
mod worker;

pub use commands::{spawn, CoordinatorHandle};
pub use decision::{next_available_path, Decision, DecisionAction, DecisionTable, PendingDecision};
pub use types::{
    filename_from_url, StartOutcome, TransferPhase, TransferRequest, TransferSnapshot,
    FALLBACK_FILENAME,
};
