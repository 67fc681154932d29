//! Pending decisions keyed by correlation id.
//!
//! Each raised conflict gets a fresh correlation id. Resolving removes the
//! entry before anything acts on it, so a second reply finds nothing.

use crate::matcher::{FingerprintMatch, MatchKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DecisionAction {
    Overwrite,
    Rename,
    Skip,
    /// Anything else the observer sent.
    Other(String),
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionAction::Overwrite => write!(f, "overwrite"),
            DecisionAction::Rename => write!(f, "rename"),
            DecisionAction::Skip => write!(f, "skip"),
            DecisionAction::Other(s) => write!(f, "{}", s),
        }
    }
}

impl From<String> for DecisionAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "overwrite" => DecisionAction::Overwrite,
            "rename" => DecisionAction::Rename,
            "skip" => DecisionAction::Skip,
            _ => DecisionAction::Other(s),
        }
    }
}

impl From<DecisionAction> for String {
    fn from(action: DecisionAction) -> Self {
        action.to_string()
    }
}

/// Observer reply to a raised conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
}

impl Decision {
    pub fn overwrite() -> Self {
        Self {
            action: DecisionAction::Overwrite,
        }
    }

    pub fn rename() -> Self {
        Self {
            action: DecisionAction::Rename,
        }
    }

    pub fn skip() -> Self {
        Self {
            action: DecisionAction::Skip,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDecision {
    pub correlation_id: String,
    pub transfer_id: String,
    pub existing_path: PathBuf,
    pub kind: MatchKind,
    pub score: Option<u32>,
    /// Raised before the host transfer was created.
    pub deferred: bool,
}

#[derive(Debug, Default)]
pub struct DecisionTable {
    pending: HashMap<String, PendingDecision>,
}

impl DecisionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conflict for `transfer_id` and return its correlation id.
    pub fn raise(&mut self, transfer_id: &str, hit: &FingerprintMatch, deferred: bool) -> String {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        self.pending.insert(
            correlation_id.clone(),
            PendingDecision {
                correlation_id: correlation_id.clone(),
                transfer_id: transfer_id.to_string(),
                existing_path: hit.existing_path.clone(),
                kind: hit.kind,
                score: hit.score,
                deferred,
            },
        );
        correlation_id
    }

    /// One-shot: the entry is gone after the first call.
    pub fn take(&mut self, correlation_id: &str) -> Option<PendingDecision> {
        self.pending.remove(correlation_id)
    }

    /// Drop every pending decision of a transfer that is going away.
    pub fn invalidate_transfer(&mut self, transfer_id: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.transfer_id != transfer_id);
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// First `base (n).ext` (n = 1, 2, ...) that neither exists on disk nor is
/// reported taken. Check-then-use: another writer may still race for it.
pub fn next_available_path(base: &Path, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let dir = base.parent().unwrap_or_else(|| Path::new(""));
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = base
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, counter, ext));
        if !candidate.exists() && !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
