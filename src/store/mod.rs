//! Persisted fingerprint store keyed by exact hash.
//!
//! Reads work on an immutable snapshot; writers are serialized and persist the
//! whole document before the new snapshot becomes visible.

mod document;
pub mod history;

pub use document::JsonDocument;
pub use history::{Category, DashboardStats, HistoryEntry, TransferHistory};

use crate::error::Result;
use crate::fingerprint::Fingerprints;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub exact_hash: String,
    pub path: PathBuf,
    pub partial_hash: Option<String>,
    pub fuzzy_a: Option<String>,
    pub fuzzy_b: Option<String>,
    pub size: u64,
}

impl FingerprintRecord {
    pub fn from_fingerprints(path: impl Into<PathBuf>, fingerprints: Fingerprints) -> Self {
        Self {
            exact_hash: fingerprints.exact_hash,
            path: path.into(),
            partial_hash: Some(fingerprints.partial_hash),
            fuzzy_a: Some(fingerprints.fuzzy_a),
            fuzzy_b: fingerprints.fuzzy_b,
            size: fingerprints.size,
        }
    }

    /// Final path component as text, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// On-disk value; the exact hash is the map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    path: PathBuf,
    #[serde(default)]
    partial: Option<String>,
    #[serde(default)]
    fuzzy_a: Option<String>,
    #[serde(default)]
    fuzzy_b: Option<String>,
    #[serde(default)]
    size: u64,
}

type RecordMap = BTreeMap<String, FingerprintRecord>;

fn to_document(records: &RecordMap) -> BTreeMap<&str, StoredRecord> {
    records
        .iter()
        .map(|(key, r)| {
            (
                key.as_str(),
                StoredRecord {
                    path: r.path.clone(),
                    partial: r.partial_hash.clone(),
                    fuzzy_a: r.fuzzy_a.clone(),
                    fuzzy_b: r.fuzzy_b.clone(),
                    size: r.size,
                },
            )
        })
        .collect()
}

fn from_document(document: BTreeMap<String, StoredRecord>) -> RecordMap {
    document
        .into_iter()
        .map(|(key, r)| {
            let record = FingerprintRecord {
                exact_hash: key.clone(),
                path: r.path,
                partial_hash: r.partial,
                fuzzy_a: r.fuzzy_a,
                fuzzy_b: r.fuzzy_b,
                size: r.size,
            };
            (key, record)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// A record with this exact hash already exists; nothing was written.
    AlreadyPresent,
}

pub struct FingerprintStore {
    document: JsonDocument,
    records: RwLock<Arc<RecordMap>>,
    write_lock: Mutex<()>,
}

impl FingerprintStore {
    /// Open the store at `path`. A missing, unreadable or corrupt document
    /// yields an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let document = JsonDocument::new(path);
        let records = match document.load::<BTreeMap<String, StoredRecord>>().await {
            Ok(Some(raw)) => from_document(raw),
            Ok(None) => RecordMap::new(),
            Err(e) => {
                warn!(
                    "store: cannot load {}, starting empty: {}",
                    document.path().display(),
                    e
                );
                RecordMap::new()
            }
        };
        info!(
            "store: opened {} with {} records",
            document.path().display(),
            records.len()
        );
        Self {
            document,
            records: RwLock::new(Arc::new(records)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        self.document.path()
    }

    /// Current snapshot; later writes do not affect it.
    pub fn snapshot(&self) -> Arc<RecordMap> {
        let guard = self.records.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    fn swap(&self, records: RecordMap) {
        let mut guard = self.records.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(records);
    }

    pub fn get(&self, exact_hash: &str) -> Option<FingerprintRecord> {
        self.snapshot().get(exact_hash).cloned()
    }

    pub fn all(&self) -> Vec<FingerprintRecord> {
        self.snapshot().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Register a record. Re-registering a known exact hash is acknowledged
    /// without touching the stored record.
    pub async fn put(&self, record: FingerprintRecord) -> Result<PutOutcome> {
        let _guard = self.write_lock.lock().await;
        let current = self.snapshot();
        if current.contains_key(&record.exact_hash) {
            debug!("store: {} already present", record.exact_hash);
            return Ok(PutOutcome::AlreadyPresent);
        }

        let mut next = (*current).clone();
        next.insert(record.exact_hash.clone(), record);
        self.document.save(&to_document(&next)).await?;
        self.swap(next);
        Ok(PutOutcome::Inserted)
    }

    /// Replace every record at once. On duplicate exact hashes the first
    /// record wins. Returns the number of records stored.
    pub async fn replace_all(&self, records: Vec<FingerprintRecord>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut next = RecordMap::new();
        for record in records {
            next.entry(record.exact_hash.clone()).or_insert(record);
        }
        self.document.save(&to_document(&next)).await?;
        let count = next.len();
        self.swap(next);
        info!("store: replaced contents with {} records", count);
        Ok(count)
    }
}
