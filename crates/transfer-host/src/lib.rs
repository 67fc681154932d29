//! Host transfer primitive
//!
//! The coordinator drives downloads through the [`TransferHost`] and
//! [`TransferHandle`] traits:
//! - `create` binds the destination path when the transfer is created
//! - handles expose `set_path`, `pause`, `resume` and `cancel`
//! - progress and completion are reported as [`HostEvent`]s on a channel
//!
//! [`HttpHost`] is the bundled implementation, streaming a GET response to disk.

mod http;

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;

pub use http::HttpHost;

#[derive(Debug, Error)]
pub enum HostError {
    /// The transfer already reached a terminal state; control calls no longer apply.
    #[error("transfer {0} already finished")]
    Finished(String),

    #[error("failed to start transfer: {0}")]
    Spawn(String),
}

/// Where the bytes of a transfer come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSource {
    pub url: String,
}

impl TransferSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Final state reported by the host once a transfer stops for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum DoneState {
    Completed,
    Cancelled,
    Interrupted(String),
}

impl std::fmt::Display for DoneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DoneState::Completed => write!(f, "completed"),
            DoneState::Cancelled => write!(f, "cancelled"),
            DoneState::Interrupted(_) => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HostEventKind {
    /// `total_bytes` is 0 when the size is unknown.
    Progress {
        received_bytes: u64,
        total_bytes: u64,
    },
    Done(DoneState),
}

/// Event emitted by a running transfer, tagged with the id given to `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostEvent {
    pub transfer_id: String,
    pub kind: HostEventKind,
}

impl HostEvent {
    pub fn progress(transfer_id: &str, received_bytes: u64, total_bytes: u64) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            kind: HostEventKind::Progress {
                received_bytes,
                total_bytes,
            },
        }
    }

    pub fn done(transfer_id: &str, state: DoneState) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            kind: HostEventKind::Done(state),
        }
    }
}

/// Control surface of one in-flight transfer.
///
/// Control calls are signals: they return once the request is recorded, and
/// the transfer reacts at its next suspension point. `pause` on a paused
/// transfer and `resume` on a running one are no-ops.
pub trait TransferHandle: Send + Sync {
    /// Relocate the destination. Bytes already written move with it.
    fn set_path(&self, path: &Path) -> Result<(), HostError>;
    fn pause(&self) -> Result<(), HostError>;
    fn resume(&self) -> Result<(), HostError>;
    fn cancel(&self) -> Result<(), HostError>;
    fn is_paused(&self) -> bool;
    fn path(&self) -> PathBuf;
}

/// Factory for transfers. The destination is bound at creation time.
pub trait TransferHost: Send + Sync {
    fn create(
        &self,
        transfer_id: &str,
        source: &TransferSource,
        path: &Path,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Result<Box<dyn TransferHandle>, HostError>;
}
