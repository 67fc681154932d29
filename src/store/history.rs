//! Append-only history of completed transfers and dashboard totals.

use super::JsonDocument;
use crate::error::Result;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "heic", "mp3", "wav", "flac", "ogg", "m4a",
    "aac", "mp4", "mkv", "mov", "avi", "webm", "wmv",
];

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "txt", "md", "rtf", "odt", "xls", "xlsx", "csv", "ppt", "pptx", "epub",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Category {
    #[serde(rename = "media")]
    Media,
    #[serde(rename = "documents")]
    Documents,
    #[serde(rename = "others")]
    Others,
}

impl Category {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if MEDIA_EXTENSIONS.contains(&ext.as_str()) {
            Category::Media
        } else if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
            Category::Documents
        } else {
            Category::Others
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Media => write!(f, "media"),
            Category::Documents => write!(f, "documents"),
            Category::Others => write!(f, "others"),
        }
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        match s.as_str() {
            "media" => Category::Media,
            "documents" => Category::Documents,
            _ => Category::Others,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub category: Category,
    pub completed_at: i64,
}

impl HistoryEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: PathBuf, size: u64) -> Self {
        let category = Category::from_path(&path);
        Self {
            id: id.into(),
            name: name.into(),
            path,
            size,
            category,
            completed_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Byte totals per category over the whole history.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DashboardStats {
    pub total_files: usize,
    pub total_size: u64,
    pub media: u64,
    pub documents: u64,
    pub others: u64,
}

pub struct TransferHistory {
    document: JsonDocument,
    write_lock: Mutex<()>,
}

impl TransferHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            document: JsonDocument::new(path),
            write_lock: Mutex::new(()),
        }
    }

    /// Newest first. An unreadable document reads as empty.
    pub async fn entries(&self) -> Vec<HistoryEntry> {
        match self.document.load::<Vec<HistoryEntry>>().await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!(
                    "history: cannot load {}: {}",
                    self.document.path().display(),
                    e
                );
                Vec::new()
            }
        }
    }

    pub async fn append(&self, entry: HistoryEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.entries().await;
        entries.insert(0, entry);
        self.document.save(&entries).await
    }

    pub async fn stats(&self) -> DashboardStats {
        let entries = self.entries().await;
        let mut stats = DashboardStats {
            total_files: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            stats.total_size += entry.size;
            match entry.category {
                Category::Media => stats.media += entry.size,
                Category::Documents => stats.documents += entry.size,
                Category::Others => stats.others += entry.size,
            }
        }
        stats
    }
}
