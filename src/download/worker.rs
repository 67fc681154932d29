//! Coordinator worker - owns every live transfer and pending decision
//!
//! A single task processes commands from handles and events from the host in
//! arrival order. Background work (partial checks, registration, re-hash)
//! runs in spawned tasks that report back through the command channel, so all
//! state changes happen here.

use super::decision::{next_available_path, Decision, DecisionAction, DecisionTable, PendingDecision};
use super::types::{StartOutcome, TransferPhase, TransferRequest, TransferSnapshot};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{percent, EventSink, ObserverEvent};
use crate::fingerprint::{fingerprint_file, partial_digests};
use crate::matcher::{FingerprintMatch, MatchKind, MatchQuery, Matcher};
use crate::rehash;
use crate::store::{FingerprintRecord, FingerprintStore, HistoryEntry, PutOutcome, TransferHistory};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use transfer_host::{
    DoneState, HostEvent, HostEventKind, TransferHandle, TransferHost, TransferSource,
};

pub(crate) enum Command {
    Start {
        request: TransferRequest,
        reply: oneshot::Sender<Result<StartOutcome>>,
    },
    Pause {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Decide {
        correlation_id: String,
        decision: Option<Decision>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<TransferSnapshot>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Rehash {
        folder: PathBuf,
        reply: oneshot::Sender<Result<usize>>,
    },
    PartialChecked {
        id: String,
        hit: Option<FingerprintMatch>,
    },
    Registered {
        id: String,
    },
}

struct TransferEntry {
    id: String,
    filename: String,
    source: TransferSource,
    target_path: PathBuf,
    received_bytes: u64,
    total_bytes: u64,
    phase: TransferPhase,
    partial_checked: bool,
    pending_decision: Option<String>,
    /// `None` until the host transfer exists.
    handle: Option<Box<dyn TransferHandle>>,
}

impl TransferEntry {
    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id.clone(),
            filename: self.filename.clone(),
            target_path: self.target_path.clone(),
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            phase: self.phase,
            partial_checked: self.partial_checked,
            pending_decision: self.pending_decision.clone(),
        }
    }
}

/// How a resolved decision leaves the transfer.
enum Resolution {
    Continue,
    Skip,
    Failed(String),
}

/// Remove a file that is being replaced or abandoned. Missing files are fine.
async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("cleanup: removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("cleanup: cannot remove {}: {}", path.display(), e),
    }
}

pub(crate) struct Coordinator {
    config: Config,
    host: Arc<dyn TransferHost>,
    store: Arc<FingerprintStore>,
    history: Arc<TransferHistory>,
    matcher: Matcher,
    sink: Arc<dyn EventSink>,
    transfers: HashMap<String, TransferEntry>,
    decisions: DecisionTable,
    commands: mpsc::UnboundedReceiver<Command>,
    loopback: mpsc::WeakUnboundedSender<Command>,
    host_tx: mpsc::UnboundedSender<HostEvent>,
    host_rx: mpsc::UnboundedReceiver<HostEvent>,
    registrations_in_flight: usize,
    flush_waiters: Vec<oneshot::Sender<()>>,
    rehash_running: Arc<AtomicBool>,
}

impl Coordinator {
    pub(crate) fn new(
        config: Config,
        host: Arc<dyn TransferHost>,
        store: Arc<FingerprintStore>,
        history: Arc<TransferHistory>,
        sink: Arc<dyn EventSink>,
        commands: mpsc::UnboundedReceiver<Command>,
        loopback: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let matcher = Matcher::new(Arc::clone(&store), config.policy.clone());
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        Self {
            config,
            host,
            store,
            history,
            matcher,
            sink,
            transfers: HashMap::new(),
            decisions: DecisionTable::new(),
            commands,
            loopback,
            host_tx,
            host_rx,
            registrations_in_flight: 0,
            flush_waiters: Vec::new(),
            rehash_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            "coordinator: started (downloads in {})",
            self.config.download_dir.display()
        );
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.host_rx.recv() => self.handle_host_event(event).await,
            }
        }
        info!("coordinator: stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { request, reply } => {
                let _ = reply.send(self.start(request).await);
            }
            Command::Pause { id, reply } => {
                let _ = reply.send(self.pause(&id));
            }
            Command::Resume { id, reply } => {
                let _ = reply.send(self.resume(&id));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(&id).await);
            }
            Command::Decide {
                correlation_id,
                decision,
            } => self.decide(&correlation_id, decision).await,
            Command::Snapshot { reply } => {
                let mut snapshots: Vec<_> =
                    self.transfers.values().map(TransferEntry::snapshot).collect();
                snapshots.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(snapshots);
            }
            Command::Flush { reply } => {
                if self.registrations_in_flight == 0 {
                    let _ = reply.send(());
                } else {
                    self.flush_waiters.push(reply);
                }
            }
            Command::Rehash { folder, reply } => self.start_rehash(folder, reply),
            Command::PartialChecked { id, hit } => self.partial_checked(&id, hit),
            Command::Registered { id } => self.registered(&id),
        }
    }

    async fn handle_host_event(&mut self, event: HostEvent) {
        match event.kind {
            HostEventKind::Progress {
                received_bytes,
                total_bytes,
            } => self.on_progress(&event.transfer_id, received_bytes, total_bytes),
            HostEventKind::Done(state) => self.on_done(&event.transfer_id, state).await,
        }
    }

    // ---------- Starting ----------

    async fn start(&mut self, request: TransferRequest) -> Result<StartOutcome> {
        let filename = request.resolve_filename();
        tokio::fs::create_dir_all(&self.config.download_dir).await?;
        let target_path = self.config.download_dir.join(&filename);
        let id = uuid::Uuid::new_v4().to_string();

        let mut entry = TransferEntry {
            id: id.clone(),
            filename,
            source: TransferSource::new(request.url),
            target_path,
            received_bytes: 0,
            total_bytes: 0,
            phase: TransferPhase::Starting,
            partial_checked: false,
            pending_decision: None,
            handle: None,
        };

        if let Some(hit) = self.start_conflict(&entry.filename, &entry.target_path) {
            let correlation_id = self.raise_conflict(&id, &entry.filename, &hit, true);
            entry.pending_decision = Some(correlation_id.clone());
            info!(
                "transfer: {} deferred, {} conflict with {}",
                id,
                hit.kind,
                hit.existing_path.display()
            );
            self.transfers.insert(id.clone(), entry);
            return Ok(StartOutcome::Deferred {
                transfer_id: id,
                correlation_id,
            });
        }

        self.launch(&mut entry)?;
        self.transfers.insert(id.clone(), entry);
        Ok(StartOutcome::Started { transfer_id: id })
    }

    /// Filename collisions that must be settled before the host binds a path.
    fn start_conflict(&self, filename: &str, target_path: &Path) -> Option<FingerprintMatch> {
        if target_path.exists() || self.path_held(target_path) {
            return Some(FingerprintMatch {
                kind: MatchKind::Filename,
                existing_path: target_path.to_path_buf(),
                score: None,
            });
        }
        if self.config.policy.check_store_filenames {
            return self.matcher.find(&MatchQuery {
                filename: Some(filename),
                ..Default::default()
            });
        }
        None
    }

    /// Whether any tracked transfer currently targets `path`.
    fn path_held(&self, path: &Path) -> bool {
        self.transfers.values().any(|t| t.target_path == path)
    }

    fn launch(&self, entry: &mut TransferEntry) -> Result<()> {
        let handle = self.host.create(
            &entry.id,
            &entry.source,
            &entry.target_path,
            self.host_tx.clone(),
        )?;
        entry.handle = Some(handle);
        entry.phase = TransferPhase::Streaming;
        info!(
            "transfer: {} -> {} ({})",
            entry.id,
            entry.phase,
            entry.target_path.display()
        );
        Ok(())
    }

    fn raise_conflict(
        &mut self,
        transfer_id: &str,
        name: &str,
        hit: &FingerprintMatch,
        deferred: bool,
    ) -> String {
        let correlation_id = self.decisions.raise(transfer_id, hit, deferred);
        self.sink.emit(ObserverEvent::ConflictDetected {
            correlation_id: correlation_id.clone(),
            transfer_id: transfer_id.to_string(),
            name: name.to_string(),
            existing_path: hit.existing_path.clone(),
            match_kind: hit.kind,
            score: hit.score,
        });
        correlation_id
    }

    // ---------- Control ----------

    fn pause(&mut self, id: &str) -> Result<()> {
        let entry = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTransfer(id.to_string()))?;
        if entry.phase == TransferPhase::Paused {
            debug!("transfer: {} already paused", id);
            return Ok(());
        }
        let Some(handle) = &entry.handle else {
            debug!("transfer: {} not started, nothing to pause", id);
            return Ok(());
        };
        if let Err(e) = handle.pause() {
            warn!("transfer: {} host pause failed: {}", id, e);
        }
        entry.phase = TransferPhase::Paused;
        info!("transfer: {} -> {}", id, entry.phase);
        Ok(())
    }

    fn resume(&mut self, id: &str) -> Result<()> {
        let entry = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTransfer(id.to_string()))?;
        if let Some(correlation_id) = &entry.pending_decision {
            info!(
                "transfer: {} resume ignored, decision {} pending",
                id, correlation_id
            );
            return Ok(());
        }
        if entry.phase != TransferPhase::Paused {
            debug!("transfer: {} not paused ({})", id, entry.phase);
            return Ok(());
        }
        if let Some(handle) = &entry.handle {
            if let Err(e) = handle.resume() {
                warn!("transfer: {} host resume failed: {}", id, e);
            }
        }
        entry.phase = TransferPhase::Streaming;
        info!("transfer: {} -> {}", id, entry.phase);
        Ok(())
    }

    async fn cancel(&mut self, id: &str) -> Result<()> {
        let entry = self
            .transfers
            .remove(id)
            .ok_or_else(|| Error::UnknownTransfer(id.to_string()))?;
        self.finish_terminal(entry, TransferPhase::Cancelled, true)
            .await;
        Ok(())
    }

    /// Leave the arena for good: drop pending decisions, stop the host,
    /// clean up partial bytes and tell the observer.
    async fn finish_terminal(&mut self, entry: TransferEntry, phase: TransferPhase, cancel_host: bool) {
        let dropped = self.decisions.invalidate_transfer(&entry.id);
        if dropped > 0 {
            debug!("decision: {} pending for {} invalidated", dropped, entry.id);
        }
        if let Some(handle) = &entry.handle {
            if cancel_host {
                if let Err(e) = handle.cancel() {
                    debug!("transfer: {} host cancel: {}", entry.id, e);
                }
            }
            remove_file_quietly(&entry.target_path).await;
        }

        let state = match phase {
            TransferPhase::Failed => "interrupted",
            _ => "cancelled",
        };
        info!("transfer: {} -> {}", entry.id, phase);
        self.sink.emit(ObserverEvent::TransferError {
            id: entry.id,
            state: state.to_string(),
        });
    }

    // ---------- Decisions ----------

    async fn decide(&mut self, correlation_id: &str, decision: Option<Decision>) {
        let Some(pending) = self.decisions.take(correlation_id) else {
            debug!("decision: {} ignored (stale)", correlation_id);
            return;
        };
        let Some(mut entry) = self.transfers.remove(&pending.transfer_id) else {
            debug!(
                "decision: {} ignored, transfer {} gone",
                correlation_id, pending.transfer_id
            );
            return;
        };
        entry.pending_decision = None;

        let action = decision.map(|d| d.action);
        info!(
            "decision: {} -> {}",
            correlation_id,
            action
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        let resolution = if pending.deferred {
            self.resolve_deferred(&mut entry, &pending, action).await
        } else {
            self.resolve_in_flight(&mut entry, &pending, action).await
        };

        match resolution {
            Resolution::Continue => {
                self.transfers.insert(entry.id.clone(), entry);
            }
            Resolution::Skip => {
                self.finish_terminal(entry, TransferPhase::Cancelled, true)
                    .await
            }
            Resolution::Failed(reason) => {
                warn!("transfer: {} could not start: {}", entry.id, reason);
                self.finish_terminal(entry, TransferPhase::Failed, false)
                    .await
            }
        }
    }

    /// Where an overwrite lands, or a fresh name if another transfer holds it.
    fn overwrite_target(&self, entry: &TransferEntry, existing: &Path) -> (PathBuf, bool) {
        if self.path_held(existing) {
            warn!(
                "decision: {} is held by another transfer, renaming instead",
                existing.display()
            );
            return (self.renamed_target(entry), false);
        }
        (existing.to_path_buf(), true)
    }

    fn renamed_target(&self, entry: &TransferEntry) -> PathBuf {
        next_available_path(&entry.target_path, |p| self.path_held(p))
    }

    async fn resolve_deferred(
        &self,
        entry: &mut TransferEntry,
        pending: &PendingDecision,
        action: Option<DecisionAction>,
    ) -> Resolution {
        match action {
            Some(DecisionAction::Overwrite) => {
                let (target, replaces) = self.overwrite_target(entry, &pending.existing_path);
                if replaces {
                    remove_file_quietly(&target).await;
                }
                entry.target_path = target;
            }
            Some(DecisionAction::Rename) => {
                entry.target_path = self.renamed_target(entry);
            }
            _ => return Resolution::Skip,
        }

        match self.launch(entry) {
            Ok(()) => Resolution::Continue,
            Err(e) => Resolution::Failed(e.to_string()),
        }
    }

    async fn resolve_in_flight(
        &self,
        entry: &mut TransferEntry,
        pending: &PendingDecision,
        action: Option<DecisionAction>,
    ) -> Resolution {
        let relocate_to = match action {
            None | Some(DecisionAction::Skip) => return Resolution::Skip,
            Some(DecisionAction::Overwrite) if pending.existing_path == entry.target_path => None,
            Some(DecisionAction::Overwrite) => {
                let (target, replaces) = self.overwrite_target(entry, &pending.existing_path);
                if replaces {
                    remove_file_quietly(&target).await;
                }
                Some(target)
            }
            Some(DecisionAction::Rename) => Some(self.renamed_target(entry)),
            Some(DecisionAction::Other(action)) => {
                debug!("decision: unrecognised action {:?}, resuming", action);
                None
            }
        };

        let Some(handle) = &entry.handle else {
            return Resolution::Failed("transfer has no host handle".to_string());
        };
        if let Some(target) = relocate_to {
            if let Err(e) = handle.set_path(&target) {
                warn!("transfer: {} relocate failed: {}", entry.id, e);
            }
            info!("transfer: {} now saving to {}", entry.id, target.display());
            entry.target_path = target;
        }
        if let Err(e) = handle.resume() {
            warn!("transfer: {} host resume failed: {}", entry.id, e);
        }
        entry.phase = TransferPhase::Streaming;
        Resolution::Continue
    }

    // ---------- Streaming ----------

    fn on_progress(&mut self, id: &str, received_bytes: u64, total_bytes: u64) {
        let Some(entry) = self.transfers.get_mut(id) else {
            debug!("transfer: progress for untracked {}", id);
            return;
        };
        entry.received_bytes = received_bytes;
        entry.total_bytes = total_bytes;
        self.sink.emit(ObserverEvent::TransferProgress {
            id: entry.id.clone(),
            name: entry.filename.clone(),
            received_bytes,
            total_bytes,
            percent: percent(received_bytes, total_bytes),
        });

        if entry.partial_checked
            || entry.pending_decision.is_some()
            || received_bytes < self.config.policy.partial_check_bytes
        {
            return;
        }
        entry.partial_checked = true;
        if entry.phase == TransferPhase::Streaming {
            entry.phase = TransferPhase::PartialCheckPending;
        }
        debug!("transfer: {} partial check at {} bytes", id, received_bytes);

        let id = entry.id.clone();
        let path = entry.target_path.clone();
        let matcher = self.matcher.clone();
        let partial_bytes = self.config.policy.partial_hash_bytes;
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let hit = match partial_digests(&path, partial_bytes).await {
                Some(digests) => matcher.find(&MatchQuery {
                    partial_hash: Some(&digests.partial_hash),
                    fuzzy_a: Some(&digests.fuzzy_a),
                    ..Default::default()
                }),
                None => None,
            };
            if let Some(tx) = loopback.upgrade() {
                let _ = tx.send(Command::PartialChecked { id, hit });
            }
        });
    }

    fn partial_checked(&mut self, id: &str, hit: Option<FingerprintMatch>) {
        let Some(entry) = self.transfers.get_mut(id) else {
            debug!("transfer: partial check for {} discarded, transfer gone", id);
            return;
        };
        let Some(hit) = hit else {
            if entry.phase == TransferPhase::PartialCheckPending {
                entry.phase = TransferPhase::Streaming;
            }
            debug!("transfer: {} partial check clean", id);
            return;
        };

        if let Some(handle) = &entry.handle {
            if let Err(e) = handle.pause() {
                warn!("transfer: {} host pause failed: {}", id, e);
            }
        }
        entry.phase = TransferPhase::Paused;
        let name = entry.filename.clone();
        info!(
            "transfer: {} -> paused, {} match with {}",
            id,
            hit.kind,
            hit.existing_path.display()
        );

        let correlation_id = self.raise_conflict(id, &name, &hit, false);
        if let Some(entry) = self.transfers.get_mut(id) {
            entry.pending_decision = Some(correlation_id);
        }
    }

    async fn on_done(&mut self, id: &str, state: DoneState) {
        let Some(entry) = self.transfers.remove(id) else {
            debug!("transfer: done ({}) for untracked {}", state, id);
            return;
        };
        match state {
            DoneState::Completed => self.complete(entry),
            DoneState::Cancelled => {
                self.finish_terminal(entry, TransferPhase::Cancelled, false)
                    .await
            }
            DoneState::Interrupted(reason) => {
                warn!("transfer: {} interrupted: {}", id, reason);
                self.finish_terminal(entry, TransferPhase::Failed, false)
                    .await
            }
        }
    }

    // ---------- Completion ----------

    fn complete(&mut self, entry: TransferEntry) {
        let dropped = self.decisions.invalidate_transfer(&entry.id);
        if dropped > 0 {
            debug!("decision: {} pending for {} invalidated", dropped, entry.id);
        }
        let final_path = entry
            .handle
            .as_ref()
            .map(|h| h.path())
            .unwrap_or_else(|| entry.target_path.clone());
        info!(
            "transfer: {} -> {} ({})",
            entry.id,
            TransferPhase::Completed,
            final_path.display()
        );
        self.sink.emit(ObserverEvent::TransferDone {
            id: entry.id.clone(),
            name: entry.filename.clone(),
            final_path: final_path.clone(),
        });

        self.registrations_in_flight += 1;
        let registration = Registration {
            id: entry.id,
            name: entry.filename,
            path: final_path,
            partial_bytes: self.config.policy.partial_hash_bytes,
            store: Arc::clone(&self.store),
            history: Arc::clone(&self.history),
            sink: Arc::clone(&self.sink),
        };
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let id = registration.id.clone();
            registration.run().await;
            if let Some(tx) = loopback.upgrade() {
                let _ = tx.send(Command::Registered { id });
            }
        });
    }

    fn registered(&mut self, id: &str) {
        self.registrations_in_flight = self.registrations_in_flight.saturating_sub(1);
        debug!(
            "registration: {} finished, {} in flight",
            id, self.registrations_in_flight
        );
        if self.registrations_in_flight == 0 {
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    // ---------- Re-hash ----------

    fn start_rehash(&mut self, folder: PathBuf, reply: oneshot::Sender<Result<usize>>) {
        if self.rehash_running.swap(true, Ordering::SeqCst) {
            let _ = reply.send(Err(Error::RehashInProgress));
            return;
        }
        let store = Arc::clone(&self.store);
        let sink = Arc::clone(&self.sink);
        let running = Arc::clone(&self.rehash_running);
        let hasher = rehash::default_hasher(self.config.policy.partial_hash_bytes);

        tokio::spawn(async move {
            let progress_sink = Arc::clone(&sink);
            let result = rehash::run(folder, hasher, &store, move |p| {
                progress_sink.emit(ObserverEvent::RehashProgress {
                    index: p.index,
                    total: p.total,
                    current_file: p.current_file,
                })
            })
            .await;

            match &result {
                Ok(records) => sink.emit(ObserverEvent::RehashFinished { records: *records }),
                Err(e) => sink.emit(ObserverEvent::RehashFailed {
                    error: e.to_string(),
                }),
            }
            running.store(false, Ordering::SeqCst);
            let _ = reply.send(result);
        });
    }
}

/// Post-completion bookkeeping for one finished transfer.
struct Registration {
    id: String,
    name: String,
    path: PathBuf,
    partial_bytes: u64,
    store: Arc<FingerprintStore>,
    history: Arc<TransferHistory>,
    sink: Arc<dyn EventSink>,
}

impl Registration {
    async fn run(self) {
        let fingerprints = fingerprint_file(&self.path, self.partial_bytes).await;
        let size = fingerprints.as_ref().map(|f| f.size).unwrap_or(0);

        let entry = HistoryEntry::new(&self.id, &self.name, self.path.clone(), size);
        if let Err(e) = self.history.append(entry).await {
            warn!("history: cannot record {}: {}", self.id, e);
        }

        let Some(fingerprints) = fingerprints else {
            warn!(
                "registration: {} unreadable, not registered",
                self.path.display()
            );
            return;
        };
        let record = FingerprintRecord::from_fingerprints(&self.path, fingerprints);
        let exact_hash = record.exact_hash.clone();
        match self.store.put(record).await {
            Ok(outcome) => {
                let duplicate = outcome == PutOutcome::AlreadyPresent;
                info!(
                    "registration: {} -> {}{}",
                    self.id,
                    exact_hash,
                    if duplicate { " (already known)" } else { "" }
                );
                self.sink.emit(ObserverEvent::FingerprintRegistered {
                    id: self.id,
                    path: self.path,
                    exact_hash,
                    duplicate,
                });
            }
            Err(e) => warn!("registration: {} store write failed: {}", self.id, e),
        }
    }
}
