#![allow(dead_code)]

use dupeguard::fingerprint::fingerprint_file;
use dupeguard::transfer_host::{
    DoneState, HostError, HostEvent, TransferHandle, TransferHost, TransferSource,
};
use dupeguard::{
    spawn, Config, CoordinatorHandle, EventSink, FingerprintRecord, FingerprintStore,
    MatchPolicy, ObserverEvent,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const MIB: usize = 1024 * 1024;

/// One transfer created through [`ScriptedHost`]. The test decides when bytes
/// arrive and when the transfer finishes.
pub struct ScriptedTransfer {
    pub id: String,
    pub source: TransferSource,
    path: Mutex<PathBuf>,
    received: AtomicU64,
    total: AtomicU64,
    paused: AtomicBool,
    finished: AtomicBool,
    calls: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl ScriptedTransfer {
    pub fn path(&self) -> PathBuf {
        self.path.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Append bytes to the current destination, then report progress.
    pub fn write(&self, bytes: &[u8]) {
        let path = self.path();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        let received = self.received.fetch_add(bytes.len() as u64, Ordering::SeqCst)
            + bytes.len() as u64;
        let _ = self.events.send(HostEvent::progress(
            &self.id,
            received,
            self.total.load(Ordering::SeqCst),
        ));
    }

    pub fn complete(&self) {
        self.finish(DoneState::Completed);
    }

    pub fn fail(&self, reason: &str) {
        self.finish(DoneState::Interrupted(reason.to_string()));
    }

    fn finish(&self, state: DoneState) {
        self.finished.store(true, Ordering::SeqCst);
        let _ = self.events.send(HostEvent::done(&self.id, state));
    }

    fn record(&self, call: &str) -> Result<(), HostError> {
        self.calls.lock().unwrap().push(call.to_string());
        if self.finished.load(Ordering::SeqCst) {
            return Err(HostError::Finished(self.id.clone()));
        }
        Ok(())
    }
}

struct ScriptedHandle(Arc<ScriptedTransfer>);

impl TransferHandle for ScriptedHandle {
    fn set_path(&self, path: &Path) -> Result<(), HostError> {
        self.0.record("set_path")?;
        let mut current = self.0.path.lock().unwrap();
        if current.exists() {
            std::fs::rename(&*current, path).unwrap();
        }
        *current = path.to_path_buf();
        Ok(())
    }

    fn pause(&self) -> Result<(), HostError> {
        self.0.record("pause")?;
        self.0.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<(), HostError> {
        self.0.record("resume")?;
        self.0.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn cancel(&self) -> Result<(), HostError> {
        self.0.record("cancel")?;
        self.0.finish(DoneState::Cancelled);
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.0.is_paused()
    }

    fn path(&self) -> PathBuf {
        self.0.path()
    }
}

/// In-process host: records every created transfer for the test to drive.
#[derive(Default)]
pub struct ScriptedHost {
    transfers: Mutex<HashMap<String, Arc<ScriptedTransfer>>>,
    created: Mutex<Vec<String>>,
}

impl ScriptedHost {
    pub fn transfer(&self, id: &str) -> Arc<ScriptedTransfer> {
        self.transfers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("transfer {} was never created", id))
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl TransferHost for ScriptedHost {
    fn create(
        &self,
        transfer_id: &str,
        source: &TransferSource,
        path: &Path,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Result<Box<dyn TransferHandle>, HostError> {
        let transfer = Arc::new(ScriptedTransfer {
            id: transfer_id.to_string(),
            source: source.clone(),
            path: Mutex::new(path.to_path_buf()),
            received: AtomicU64::new(0),
            total: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            events,
        });
        self.transfers
            .lock()
            .unwrap()
            .insert(transfer_id.to_string(), Arc::clone(&transfer));
        self.created.lock().unwrap().push(transfer_id.to_string());
        Ok(Box::new(ScriptedHandle(transfer)))
    }
}

pub struct Fixture {
    pub root: tempfile::TempDir,
    pub download_dir: PathBuf,
    pub library_dir: PathBuf,
    pub host: Arc<ScriptedHost>,
    pub store: Arc<FingerprintStore>,
    pub handle: CoordinatorHandle,
    pub events: mpsc::UnboundedReceiver<ObserverEvent>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_policy(MatchPolicy::default()).await
    }

    pub async fn with_policy(policy: MatchPolicy) -> Self {
        let root = tempfile::tempdir().unwrap();
        let download_dir = root.path().join("downloads");
        let library_dir = root.path().join("library");
        std::fs::create_dir_all(&download_dir).unwrap();
        std::fs::create_dir_all(&library_dir).unwrap();

        let config = Config::in_dir(root.path().join("data"), download_dir.clone())
            .with_policy(policy);
        let store = Arc::new(FingerprintStore::open(config.store_path.clone()).await);
        let host = Arc::new(ScriptedHost::default());
        let (tx, events) = mpsc::unbounded_channel();
        let sink: Arc<dyn EventSink> = Arc::new(tx);
        let handle = spawn(config, host.clone(), Arc::clone(&store), sink);

        Self {
            root,
            download_dir,
            library_dir,
            host,
            store,
            handle,
            events,
        }
    }

    /// Write `bytes` into the library folder and register them in the store.
    pub async fn seed_library_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.library_dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        let fingerprints = fingerprint_file(&path, MIB as u64).await.unwrap();
        self.store
            .put(FingerprintRecord::from_fingerprints(&path, fingerprints))
            .await
            .unwrap();
        path
    }

    /// Next event satisfying `pred`; earlier events are discarded.
    pub async fn wait_for(&mut self, pred: impl Fn(&ObserverEvent) -> bool) -> ObserverEvent {
        let deadline = Duration::from_secs(10);
        loop {
            let event = tokio::time::timeout(deadline, self.events.recv())
                .await
                .expect("timed out waiting for observer event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    /// Events already delivered, without waiting.
    pub fn drain_events(&mut self) -> Vec<ObserverEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Deterministic pseudo-random bytes.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}
