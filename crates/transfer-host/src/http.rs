//! Streaming HTTP transfers with pause/resume via Range requests

use crate::{DoneState, HostError, HostEvent, TransferHandle, TransferHost, TransferSource};
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Bytes buffered before a write; progress is reported after every write.
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
}

/// Why streaming stopped before the body was exhausted.
enum Interrupt {
    Cancelled,
    Paused,
    Relocated,
    Failed(String),
}

/// [`TransferHost`] backed by a shared reqwest client.
#[derive(Debug, Clone, Default)]
pub struct HttpHost {
    client: Client,
}

impl HttpHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl TransferHost for HttpHost {
    fn create(
        &self,
        transfer_id: &str,
        source: &TransferSource,
        path: &Path,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Result<Box<dyn TransferHandle>, HostError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| HostError::Spawn(e.to_string()))?;

        let (control_tx, control_rx) = watch::channel(Control::Running);
        let (path_tx, path_rx) = watch::channel(path.to_path_buf());
        let cancel = CancellationToken::new();

        let job = TransferJob {
            client: self.client.clone(),
            transfer_id: transfer_id.to_string(),
            url: source.url.clone(),
            control: control_rx,
            path: path_rx,
            cancel: cancel.clone(),
            events,
        };
        runtime.spawn(job.run());

        info!("host_transfer: {} -> created at {}", transfer_id, path.display());
        Ok(Box::new(HttpTransferHandle {
            transfer_id: transfer_id.to_string(),
            control: control_tx,
            path: path_tx,
            cancel,
        }))
    }
}

struct HttpTransferHandle {
    transfer_id: String,
    control: watch::Sender<Control>,
    path: watch::Sender<PathBuf>,
    cancel: CancellationToken,
}

impl HttpTransferHandle {
    fn ensure_live(&self) -> Result<(), HostError> {
        if self.control.is_closed() || self.cancel.is_cancelled() {
            return Err(HostError::Finished(self.transfer_id.clone()));
        }
        Ok(())
    }

    fn set_control(&self, next: Control) -> Result<(), HostError> {
        self.ensure_live()?;
        self.control.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        Ok(())
    }
}

impl TransferHandle for HttpTransferHandle {
    fn set_path(&self, path: &Path) -> Result<(), HostError> {
        self.ensure_live()?;
        let next = path.to_path_buf();
        self.path.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        Ok(())
    }

    fn pause(&self) -> Result<(), HostError> {
        self.set_control(Control::Paused)
    }

    fn resume(&self) -> Result<(), HostError> {
        self.set_control(Control::Running)
    }

    fn cancel(&self) -> Result<(), HostError> {
        self.ensure_live()?;
        self.cancel.cancel();
        Ok(())
    }

    fn is_paused(&self) -> bool {
        *self.control.borrow() == Control::Paused
    }

    fn path(&self) -> PathBuf {
        self.path.borrow().clone()
    }
}

struct TransferJob {
    client: Client,
    transfer_id: String,
    url: String,
    control: watch::Receiver<Control>,
    path: watch::Receiver<PathBuf>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl TransferJob {
    async fn run(mut self) {
        let mut active_path = self.path.borrow_and_update().clone();
        let result = self.drive(&mut active_path).await;
        let state = self.settle(&mut active_path, result).await;
        info!("host_transfer: {} -> {}", self.transfer_id, state);
        let _ = self.events.send(HostEvent::done(&self.transfer_id, state));
    }

    /// Final state for a finished drive. A completed body is moved to the
    /// latest requested path first, since `set_path` may land after the last
    /// chunk was written.
    async fn settle(&mut self, active_path: &mut PathBuf, result: Result<(), Interrupt>) -> DoneState {
        match result {
            Ok(()) => match self.relocate(active_path).await {
                Ok(()) => DoneState::Completed,
                Err(Interrupt::Failed(reason)) => {
                    warn!("host_transfer: {} -> interrupted: {}", self.transfer_id, reason);
                    DoneState::Interrupted(reason)
                }
                Err(_) => DoneState::Completed,
            },
            Err(Interrupt::Cancelled) => {
                let _ = tokio::fs::remove_file(&*active_path).await;
                DoneState::Cancelled
            }
            Err(Interrupt::Failed(reason)) => {
                warn!("host_transfer: {} -> interrupted: {}", self.transfer_id, reason);
                DoneState::Interrupted(reason)
            }
            Err(Interrupt::Paused) | Err(Interrupt::Relocated) => {
                DoneState::Interrupted("transfer stopped unexpectedly".to_string())
            }
        }
    }

    /// Request/stream loop. Each pass (re)issues the request from the bytes
    /// already on disk; pausing or relocating ends the pass.
    async fn drive(&mut self, active_path: &mut PathBuf) -> Result<(), Interrupt> {
        let mut received: u64 = 0;

        loop {
            self.wait_for_running().await?;
            self.relocate(active_path).await?;

            let mut request = self.client.get(&self.url);
            if received > 0 {
                request = request.header("Range", format!("bytes={}-", received));
            }

            let response = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Interrupt::Cancelled),
                response = request.send() => response
                    .map_err(|e| Interrupt::Failed(format!("request failed: {}", e)))?,
            };

            let status = response.status();
            if !status.is_success() {
                return Err(Interrupt::Failed(format!("server responded {}", status)));
            }
            if received > 0 && status != StatusCode::PARTIAL_CONTENT {
                debug!(
                    "host_transfer: {} range ignored by server, restarting",
                    self.transfer_id
                );
                received = 0;
            }

            let total = response
                .content_length()
                .map(|len| len + received)
                .unwrap_or(0);

            if let Some(parent) = active_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Interrupt::Failed(format!("failed to create directory: {}", e)))?;
            }
            let mut file = open_destination(active_path, received > 0)
                .await
                .map_err(|e| Interrupt::Failed(format!("failed to open file: {}", e)))?;

            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::with_capacity(WRITE_BUFFER_SIZE);

            let interrupt = loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break Some(Interrupt::Cancelled),
                    changed = self.control.changed() => {
                        if changed.is_err() {
                            break Some(Interrupt::Cancelled);
                        }
                        if *self.control.borrow_and_update() == Control::Paused {
                            break Some(Interrupt::Paused);
                        }
                    }
                    changed = self.path.changed() => {
                        if changed.is_err() {
                            break Some(Interrupt::Cancelled);
                        }
                        break Some(Interrupt::Relocated);
                    }
                    chunk = stream.next() => match chunk {
                        None => break None,
                        Some(Err(e)) => break Some(Interrupt::Failed(format!("failed to read chunk: {}", e))),
                        Some(Ok(bytes)) => {
                            buffer.extend_from_slice(&bytes);
                            if buffer.len() >= WRITE_BUFFER_SIZE {
                                received += flush(&mut file, &mut buffer).await?;
                                let _ = self.events.send(HostEvent::progress(&self.transfer_id, received, total));
                            }
                        }
                    }
                }
            };

            match interrupt {
                Some(Interrupt::Cancelled) => return Err(Interrupt::Cancelled),
                Some(Interrupt::Failed(reason)) => return Err(Interrupt::Failed(reason)),
                Some(Interrupt::Paused) | Some(Interrupt::Relocated) => {
                    received += flush(&mut file, &mut buffer).await?;
                    let _ = self
                        .events
                        .send(HostEvent::progress(&self.transfer_id, received, total));
                    debug!("host_transfer: {} -> suspended at {} bytes", self.transfer_id, received);
                }
                None => {
                    received += flush(&mut file, &mut buffer).await?;
                    file.flush()
                        .await
                        .map_err(|e| Interrupt::Failed(format!("failed to flush file: {}", e)))?;
                    let _ = self
                        .events
                        .send(HostEvent::progress(&self.transfer_id, received, received.max(total)));
                    return Ok(());
                }
            }
        }
    }

    async fn wait_for_running(&mut self) -> Result<(), Interrupt> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            if *self.control.borrow_and_update() == Control::Running {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Interrupt::Cancelled),
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return Err(Interrupt::Cancelled);
                    }
                }
            }
        }
    }

    /// Move bytes already written to the latest requested path.
    async fn relocate(&mut self, active_path: &mut PathBuf) -> Result<(), Interrupt> {
        let requested = self.path.borrow_and_update().clone();
        if requested == *active_path {
            return Ok(());
        }
        if let Some(parent) = requested.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Interrupt::Failed(format!("failed to create directory: {}", e)))?;
        }
        if tokio::fs::try_exists(&*active_path).await.unwrap_or(false) {
            tokio::fs::rename(&*active_path, &requested)
                .await
                .map_err(|e| Interrupt::Failed(format!("failed to move partial file: {}", e)))?;
        }
        info!(
            "host_transfer: {} relocated {} -> {}",
            self.transfer_id,
            active_path.display(),
            requested.display()
        );
        *active_path = requested;
        Ok(())
    }
}

async fn open_destination(path: &Path, append: bool) -> std::io::Result<File> {
    if append {
        OpenOptions::new().append(true).create(true).open(path).await
    } else {
        File::create(path).await
    }
}

async fn flush(file: &mut File, buffer: &mut Vec<u8>) -> Result<u64, Interrupt> {
    if buffer.is_empty() {
        return Ok(0);
    }
    file.write_all(buffer)
        .await
        .map_err(|e| Interrupt::Failed(format!("failed to write buffer: {}", e)))?;
    let written = buffer.len() as u64;
    buffer.clear();
    Ok(written)
}
