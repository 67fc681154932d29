//! Chunked file readers feeding [`Fingerprinter`].

use super::{Fingerprinter, Fingerprints};
use log::warn;
use std::io::Read;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Read size per chunk (64 KB)
const CHUNK_SIZE: usize = 64 * 1024;

/// Hand control back to the scheduler after this many chunks (1 MB).
const YIELD_EVERY_CHUNKS: usize = 16;

/// Digests of the bytes written so far to an in-progress file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDigests {
    pub partial_hash: String,
    pub fuzzy_a: String,
}

async fn hash_file(path: &Path, partial_bytes: u64) -> std::io::Result<Fingerprints> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut fingerprinter = Fingerprinter::new(partial_bytes);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut chunks = 0usize;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        fingerprinter.update(&buf[..n]);
        chunks += 1;
        if chunks % YIELD_EVERY_CHUNKS == 0 {
            tokio::task::yield_now().await;
        }
    }

    Ok(fingerprinter.finish())
}

/// Fingerprint a whole file. Unreadable input yields `None`.
pub async fn fingerprint_file(path: &Path, partial_bytes: u64) -> Option<Fingerprints> {
    match hash_file(path, partial_bytes).await {
        Ok(fingerprints) => Some(fingerprints),
        Err(e) => {
            warn!("fingerprint: cannot read {}: {}", path.display(), e);
            None
        }
    }
}

/// Blocking variant for worker threads without a runtime.
pub fn fingerprint_file_blocking(path: &Path, partial_bytes: u64) -> Option<Fingerprints> {
    let run = || -> std::io::Result<Fingerprints> {
        let mut file = std::fs::File::open(path)?;
        let mut fingerprinter = Fingerprinter::new(partial_bytes);
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            fingerprinter.update(&buf[..n]);
        }
        Ok(fingerprinter.finish())
    };

    match run() {
        Ok(fingerprints) => Some(fingerprints),
        Err(e) => {
            warn!("fingerprint: cannot read {}: {}", path.display(), e);
            None
        }
    }
}

/// Partial hash and block-hash digest of whatever the file currently holds.
pub async fn partial_digests(path: &Path, partial_bytes: u64) -> Option<PartialDigests> {
    let fingerprints = fingerprint_file(path, partial_bytes).await?;
    Some(PartialDigests {
        partial_hash: fingerprints.partial_hash,
        fuzzy_a: fingerprints.fuzzy_a,
    })
}
