//! Duplicate-aware download coordinator.
//!
//! Downloads are streamed through a host transfer primitive while their
//! bytes are fingerprinted (SHA-256 exact and prefix hashes plus two
//! similarity digests) and matched against a persisted fingerprint store.
//! Detected duplicates pause the transfer and wait for an observer decision.

pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod matcher;
pub mod rehash;
pub mod store;

pub use config::{Config, MatchPolicy};
pub use download::{
    spawn, CoordinatorHandle, Decision, DecisionAction, StartOutcome, TransferPhase,
    TransferRequest, TransferSnapshot,
};
pub use error::{Error, Result};
pub use events::{EventSink, LogSink, ObserverEvent};
pub use matcher::{FingerprintMatch, MatchKind, MatchQuery, Matcher};
pub use store::{FingerprintRecord, FingerprintStore, PutOutcome};

pub use transfer_host;
