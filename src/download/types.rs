//! Transfer phases, requests and snapshots

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Name used when nothing usable can be derived from the URL.
pub const FALLBACK_FILENAME: &str = "download";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferPhase {
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "streaming")]
    Streaming,
    #[serde(rename = "partial_check_pending")]
    PartialCheckPending,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "failed")]
    Failed,
}

impl std::fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferPhase::Starting => write!(f, "starting"),
            TransferPhase::Streaming => write!(f, "streaming"),
            TransferPhase::PartialCheckPending => write!(f, "partial_check_pending"),
            TransferPhase::Paused => write!(f, "paused"),
            TransferPhase::Completed => write!(f, "completed"),
            TransferPhase::Cancelled => write!(f, "cancelled"),
            TransferPhase::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for TransferPhase {
    fn from(s: String) -> Self {
        match s.as_str() {
            "starting" => TransferPhase::Starting,
            "streaming" => TransferPhase::Streaming,
            "partial_check_pending" => TransferPhase::PartialCheckPending,
            "paused" => TransferPhase::Paused,
            "completed" => TransferPhase::Completed,
            "cancelled" => TransferPhase::Cancelled,
            "failed" => TransferPhase::Failed,
            _ => TransferPhase::Starting,
        }
    }
}

/// A download to start. Without a filename one is guessed from the URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
}

impl TransferRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Requested filename if usable, else the URL's last path segment, else
    /// [`FALLBACK_FILENAME`].
    pub fn resolve_filename(&self) -> String {
        self.filename
            .as_deref()
            .filter(|name| is_usable_filename(name))
            .map(str::to_string)
            .or_else(|| filename_from_url(&self.url))
            .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
    }
}

fn is_usable_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Percent-decoded last segment of the URL path. `None` for unparseable URLs
/// and URLs without a usable final segment.
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(segment)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    is_usable_filename(&decoded).then_some(decoded)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    /// Handed to the host; bytes are flowing.
    Started { transfer_id: String },
    /// The target collides with something; the transfer waits for a decision
    /// before the host is involved.
    Deferred {
        transfer_id: String,
        correlation_id: String,
    },
}

impl StartOutcome {
    pub fn transfer_id(&self) -> &str {
        match self {
            StartOutcome::Started { transfer_id } => transfer_id,
            StartOutcome::Deferred { transfer_id, .. } => transfer_id,
        }
    }
}

/// Point-in-time view of a live transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSnapshot {
    pub id: String,
    pub filename: String,
    pub target_path: PathBuf,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub phase: TransferPhase,
    pub partial_checked: bool,
    pub pending_decision: Option<String>,
}
