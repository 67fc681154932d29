//! Batch re-hash: rebuild the store from one folder on the blocking pool.
//!
//! The worker owns nothing shared. It sends immutable progress messages and
//! one final batch; the store is replaced only after the batch arrives.

use crate::error::{Error, Result};
use crate::fingerprint::fingerprint_file_blocking;
use crate::store::{FingerprintRecord, FingerprintStore};
use log::{debug, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RehashProgress {
    pub index: usize,
    pub total: usize,
    pub current_file: PathBuf,
}

#[derive(Debug)]
pub enum WorkerMessage {
    Progress(RehashProgress),
    Done(Vec<FingerprintRecord>),
    Failed(String),
}

/// Regular files directly inside `folder`, sorted by path.
pub fn list_files(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Fingerprint one file with the standard algorithms.
pub fn default_hasher(partial_bytes: u64) -> impl Fn(&Path) -> Option<FingerprintRecord> + Send + 'static {
    move |path: &Path| {
        fingerprint_file_blocking(path, partial_bytes)
            .map(|fp| FingerprintRecord::from_fingerprints(path, fp))
    }
}

/// Start the worker on the blocking pool. Files the hasher cannot read are
/// skipped. Must be called from within a tokio runtime.
pub fn spawn_worker<H>(
    folder: PathBuf,
    hasher: H,
) -> (mpsc::UnboundedReceiver<WorkerMessage>, JoinHandle<()>)
where
    H: Fn(&Path) -> Option<FingerprintRecord> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = tokio::task::spawn_blocking(move || {
        let files = match list_files(&folder) {
            Ok(files) => files,
            Err(e) => {
                let _ = tx.send(WorkerMessage::Failed(format!(
                    "cannot list {}: {}",
                    folder.display(),
                    e
                )));
                return;
            }
        };

        let total = files.len();
        let mut records = Vec::with_capacity(total);
        for (i, file) in files.into_iter().enumerate() {
            match hasher(&file) {
                Some(record) => records.push(record),
                None => debug!("rehash: skipped unreadable {}", file.display()),
            }
            let progress = RehashProgress {
                index: i + 1,
                total,
                current_file: file,
            };
            if tx.send(WorkerMessage::Progress(progress)).is_err() {
                return;
            }
        }
        let _ = tx.send(WorkerMessage::Done(records));
    });
    (rx, worker)
}

fn crash_reason(error: JoinError) -> String {
    if !error.is_panic() {
        return format!("worker stopped: {}", error);
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker panicked: {}", message)
}

/// Drain a worker to completion. Returns the batch, or an error if the worker
/// failed or stopped without delivering one.
pub async fn collect(
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    mut on_progress: impl FnMut(RehashProgress),
) -> Result<Vec<FingerprintRecord>> {
    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Progress(progress) => on_progress(progress),
            WorkerMessage::Done(records) => return Ok(records),
            WorkerMessage::Failed(reason) => return Err(Error::RehashWorker(reason)),
        }
    }
    Err(Error::RehashWorker(
        "worker exited without a result".to_string(),
    ))
}

/// Re-scan `folder` and replace the store with the result.
pub async fn run<H>(
    folder: PathBuf,
    hasher: H,
    store: &FingerprintStore,
    on_progress: impl FnMut(RehashProgress),
) -> Result<usize>
where
    H: Fn(&Path) -> Option<FingerprintRecord> + Send + 'static,
{
    info!("rehash: scanning {}", folder.display());
    let (rx, worker) = spawn_worker(folder, hasher);
    let records = match collect(rx, on_progress).await {
        Ok(records) => records,
        Err(e) => {
            let e = match worker.await {
                Err(join_error) => Error::RehashWorker(crash_reason(join_error)),
                Ok(()) => e,
            };
            warn!("rehash: {}; store left untouched", e);
            return Err(e);
        }
    };
    store.replace_all(records).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_files(dir: &Path, names: &[&str]) {
        for (i, name) in names.iter().enumerate() {
            std::fs::write(dir.join(name), vec![i as u8; 1000 + i * 10]).unwrap();
        }
    }

    #[tokio::test]
    async fn rehash_replaces_store_and_reports_each_file() {
        let data = tempfile::tempdir().unwrap();
        let folder = tempfile::tempdir().unwrap();
        write_files(folder.path(), &["b.bin", "a.bin", "c.bin"]);
        std::fs::create_dir(folder.path().join("nested")).unwrap();

        let store = FingerprintStore::open(data.path().join("hashes.json")).await;
        store
            .put(FingerprintRecord {
                exact_hash: "stale".to_string(),
                path: PathBuf::from("/gone"),
                partial_hash: None,
                fuzzy_a: None,
                fuzzy_b: None,
                size: 1,
            })
            .await
            .unwrap();

        let mut progress = Vec::new();
        let count = run(
            folder.path().to_path_buf(),
            default_hasher(1024),
            &store,
            |p| progress.push(p),
        )
        .await
        .unwrap();

        assert_eq!(count, 3);
        assert!(store.get("stale").is_none());
        let indices: Vec<_> = progress.iter().map(|p| (p.index, p.total)).collect();
        assert_eq!(indices, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(progress[0].current_file, folder.path().join("a.bin"));
    }

    #[tokio::test]
    async fn crashed_worker_leaves_store_untouched() {
        let data = tempfile::tempdir().unwrap();
        let folder = tempfile::tempdir().unwrap();
        write_files(folder.path(), &["a.bin", "b.bin"]);

        let store = FingerprintStore::open(data.path().join("hashes.json")).await;
        store
            .replace_all(vec![FingerprintRecord {
                exact_hash: "keep".to_string(),
                path: PathBuf::from("/keep"),
                partial_hash: None,
                fuzzy_a: None,
                fuzzy_b: None,
                size: 1,
            }])
            .await
            .unwrap();

        let hasher = |path: &Path| -> Option<FingerprintRecord> {
            if path.ends_with("b.bin") {
                panic!("simulated worker crash");
            }
            None
        };
        let result = run(folder.path().to_path_buf(), hasher, &store, |_| {}).await;

        match result {
            Err(Error::RehashWorker(reason)) => {
                assert!(reason.contains("simulated worker crash"), "{}", reason)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.len(), 1);
        assert!(store.get("keep").is_some());
    }

    #[tokio::test]
    async fn missing_folder_is_reported() {
        let data = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(data.path().join("hashes.json")).await;
        let result = run(
            data.path().join("no-such-folder"),
            default_hasher(1024),
            &store,
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(Error::RehashWorker(_))));
    }

    #[test]
    fn list_files_is_flat_and_sorted() {
        let folder = tempfile::tempdir().unwrap();
        write_files(folder.path(), &["z.bin", "m.bin"]);
        std::fs::create_dir(folder.path().join("sub")).unwrap();
        std::fs::write(folder.path().join("sub").join("inner.bin"), b"x").unwrap();

        let files = list_files(folder.path()).unwrap();
        assert_eq!(
            files,
            vec![folder.path().join("m.bin"), folder.path().join("z.bin")]
        );
    }
}
