use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transfer host error: {0}")]
    Host(#[from] transfer_host::HostError),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("A re-hash is already running")]
    RehashInProgress,

    #[error("Re-hash worker failed: {0}")]
    RehashWorker(String),

    #[error("Coordinator is not running")]
    CoordinatorStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
