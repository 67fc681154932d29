//! Observer-facing event payloads.

use crate::matcher::MatchKind;
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ObserverEvent {
    TransferProgress {
        id: String,
        name: String,
        received_bytes: u64,
        total_bytes: u64,
        percent: f64,
    },
    TransferDone {
        id: String,
        name: String,
        final_path: PathBuf,
    },
    TransferError {
        id: String,
        state: String,
    },
    ConflictDetected {
        correlation_id: String,
        transfer_id: String,
        name: String,
        existing_path: PathBuf,
        match_kind: MatchKind,
        score: Option<u32>,
    },
    RehashProgress {
        index: usize,
        total: usize,
        current_file: PathBuf,
    },
    RehashFinished {
        records: usize,
    },
    RehashFailed {
        error: String,
    },
    FingerprintRegistered {
        id: String,
        path: PathBuf,
        exact_hash: String,
        duplicate: bool,
    },
}

impl ObserverEvent {
    /// Event name as seen by the observer.
    pub fn name(&self) -> &'static str {
        match self {
            ObserverEvent::TransferProgress { .. } => "transfer-progress",
            ObserverEvent::TransferDone { .. } => "transfer-done",
            ObserverEvent::TransferError { .. } => "transfer-error",
            ObserverEvent::ConflictDetected { .. } => "conflict-detected",
            ObserverEvent::RehashProgress { .. } => "rehash-progress",
            ObserverEvent::RehashFinished { .. } => "rehash-finished",
            ObserverEvent::RehashFailed { .. } => "rehash-failed",
            ObserverEvent::FingerprintRegistered { .. } => "fingerprint-registered",
        }
    }
}

/// Percentage with two decimals; 0 when the total is unknown.
pub fn percent(received: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = (received as f64 / total as f64) * 100.0;
    (raw.min(100.0) * 100.0).round() / 100.0
}

/// Destination for observer events. Emitting never fails the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ObserverEvent);
}

impl EventSink for mpsc::UnboundedSender<ObserverEvent> {
    fn emit(&self, event: ObserverEvent) {
        let _ = self.send(event);
    }
}

/// Writes every event to the log as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: ObserverEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!("event: {}", json),
            Err(_) => info!("event: {}", event.name()),
        }
    }
}
