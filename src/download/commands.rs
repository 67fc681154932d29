//! Public control surface of the coordinator

use super::decision::Decision;
use super::types::{StartOutcome, TransferRequest, TransferSnapshot};
use super::worker::{Command, Coordinator};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::store::{DashboardStats, FingerprintStore, HistoryEntry, TransferHistory};
use log::warn;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use transfer_host::TransferHost;

/// Cloneable handle to a running coordinator. The coordinator stops once
/// every handle is dropped.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    history: Arc<TransferHistory>,
}

/// Start the coordinator on the current tokio runtime.
pub fn spawn(
    config: Config,
    host: Arc<dyn TransferHost>,
    store: Arc<FingerprintStore>,
    sink: Arc<dyn EventSink>,
) -> CoordinatorHandle {
    let history = Arc::new(TransferHistory::new(config.history_path.clone()));
    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(
        config,
        host,
        store,
        Arc::clone(&history),
        sink,
        rx,
        tx.downgrade(),
    );
    tokio::spawn(coordinator.run());
    CoordinatorHandle {
        commands: tx,
        history,
    }
}

impl CoordinatorHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| Error::CoordinatorStopped)?;
        rx.await.map_err(|_| Error::CoordinatorStopped)
    }

    /// Start a transfer, or defer it behind a filename conflict.
    pub async fn start(&self, request: TransferRequest) -> Result<StartOutcome> {
        self.request(|reply| Command::Start { request, reply })
            .await?
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::Pause { id, reply }).await?
    }

    /// Ignored while a decision for the transfer is pending.
    pub async fn resume(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::Resume { id, reply }).await?
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    /// Reply to a raised conflict. `None` is treated as skip. Replies for
    /// unknown or already-resolved correlation ids are dropped.
    pub fn submit_decision(&self, correlation_id: &str, decision: Option<Decision>) {
        let command = Command::Decide {
            correlation_id: correlation_id.to_string(),
            decision,
        };
        if self.commands.send(command).is_err() {
            warn!("decision: {} dropped, coordinator stopped", correlation_id);
        }
    }

    pub async fn transfers(&self) -> Result<Vec<TransferSnapshot>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Resolves once every completed transfer has been registered.
    pub async fn flush_registrations(&self) -> Result<()> {
        self.request(|reply| Command::Flush { reply }).await
    }

    /// Rebuild the fingerprint store from `folder`. Returns the record count.
    pub async fn rehash(&self, folder: impl Into<PathBuf>) -> Result<usize> {
        let folder = folder.into();
        self.request(|reply| Command::Rehash { folder, reply })
            .await?
    }

    /// Completed transfers, newest first.
    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.history.entries().await
    }

    pub async fn dashboard_stats(&self) -> DashboardStats {
        self.history.stats().await
    }
}
