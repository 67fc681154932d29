//! Content fingerprints: exact hash, bounded-prefix partial hash and two
//! similarity digests.
//!
//! Every algorithm here is incremental. [`Fingerprinter`] feeds one stream of
//! chunks through all four at once so a file is read a single time; the free
//! functions are conveniences over in-memory buffers.

pub mod ctph;
mod file;
pub mod tlsh;

use sha2::{Digest, Sha256};

pub use file::{fingerprint_file, fingerprint_file_blocking, partial_digests, PartialDigests};

/// All four digests of one byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprints {
    pub exact_hash: String,
    pub partial_hash: String,
    pub fuzzy_a: String,
    pub fuzzy_b: Option<String>,
    pub size: u64,
}

/// Streaming state for every digest.
pub struct Fingerprinter {
    exact: Sha256,
    partial: Sha256,
    partial_limit: u64,
    seen: u64,
    ctph: ctph::CtphHasher,
    tlsh: tlsh::TlshHasher,
}

impl Fingerprinter {
    pub fn new(partial_limit: u64) -> Self {
        Self {
            exact: Sha256::new(),
            partial: Sha256::new(),
            partial_limit,
            seen: 0,
            ctph: ctph::CtphHasher::new(),
            tlsh: tlsh::TlshHasher::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.exact.update(chunk);
        if self.seen < self.partial_limit {
            let room = (self.partial_limit - self.seen).min(chunk.len() as u64) as usize;
            self.partial.update(&chunk[..room]);
        }
        self.ctph.update(chunk);
        self.tlsh.update(chunk);
        self.seen += chunk.len() as u64;
    }

    pub fn finish(self) -> Fingerprints {
        Fingerprints {
            exact_hash: hex::encode(self.exact.finalize()),
            partial_hash: hex::encode(self.partial.finalize()),
            fuzzy_a: self.ctph.finish(),
            fuzzy_b: self.tlsh.finish(),
            size: self.seen,
        }
    }
}

/// SHA-256 over the full input, lowercase hex.
pub fn exact_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 over at most the first `max_bytes`. Short input hashes what exists.
pub fn partial_hash(bytes: &[u8], max_bytes: u64) -> String {
    let end = (max_bytes.min(bytes.len() as u64)) as usize;
    exact_hash(&bytes[..end])
}

pub fn fuzzy_digest_a(bytes: &[u8]) -> String {
    ctph::digest(bytes)
}

/// `None` below 256 bytes or when the content is too uniform.
pub fn fuzzy_digest_b(bytes: &[u8]) -> Option<String> {
    tlsh::digest(bytes)
}
