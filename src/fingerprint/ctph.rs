//! Context-triggered piecewise hashing (spamsum/ssdeep style).
//!
//! A rolling hash over a 7-byte window picks chunk boundaries; each chunk
//! contributes one base64 character of an FNV-style hash to the digest. The
//! hasher tracks every candidate block size in a single pass so input can be
//! streamed without knowing its length up front.
//!
//! Digest format: `<block size>:<digest at block size>:<digest at 2x block size>`.

const ROLLING_WINDOW: usize = 7;
const MIN_BLOCKSIZE: u64 = 3;
const SPAMSUM_LENGTH: usize = 64;
const HALF_LENGTH: usize = SPAMSUM_LENGTH / 2;
const NUM_BLOCKHASHES: usize = 31;
const MAX_BLOCKSIZE: u64 = MIN_BLOCKSIZE << (NUM_BLOCKHASHES - 1);
const HASH_PRIME: u32 = 0x0100_0193;
const HASH_INIT: u32 = 0x2802_1967;

const B64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn block_size(index: usize) -> u64 {
    MIN_BLOCKSIZE << index
}

fn sum_hash(c: u8, h: u32) -> u32 {
    h.wrapping_mul(HASH_PRIME) ^ u32::from(c)
}

#[derive(Debug, Clone, Default)]
struct RollingHash {
    window: [u8; ROLLING_WINDOW],
    h1: u32,
    h2: u32,
    h3: u32,
    n: usize,
}

impl RollingHash {
    fn update(&mut self, c: u8) {
        let c32 = u32::from(c);
        self.h2 = self.h2.wrapping_sub(self.h1);
        self.h2 = self.h2.wrapping_add((ROLLING_WINDOW as u32).wrapping_mul(c32));
        self.h1 = self.h1.wrapping_add(c32);
        self.h1 = self.h1.wrapping_sub(u32::from(self.window[self.n % ROLLING_WINDOW]));
        self.window[self.n % ROLLING_WINDOW] = c;
        self.n += 1;
        self.h3 = (self.h3 << 5) ^ c32;
    }

    fn sum(&self) -> u32 {
        self.h1.wrapping_add(self.h2).wrapping_add(self.h3)
    }
}

#[derive(Debug, Clone)]
struct BlockHash {
    h: u32,
    half_h: u32,
    digest: Vec<u8>,
    /// Overwritable last character once `digest` is full.
    tail: Option<u8>,
    half_tail: Option<u8>,
}

impl BlockHash {
    fn new(h: u32, half_h: u32) -> Self {
        Self {
            h,
            half_h,
            digest: Vec::with_capacity(SPAMSUM_LENGTH),
            tail: None,
            half_tail: None,
        }
    }
}

/// Streaming block-hash state.
#[derive(Debug, Clone)]
pub struct CtphHasher {
    blocks: Vec<BlockHash>,
    start: usize,
    total: u64,
    roll: RollingHash,
}

impl Default for CtphHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl CtphHasher {
    pub fn new() -> Self {
        Self {
            blocks: vec![BlockHash::new(HASH_INIT, HASH_INIT)],
            start: 0,
            total: 0,
            roll: RollingHash::default(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.total += data.len() as u64;
        for &c in data {
            self.step(c);
        }
    }

    fn step(&mut self, c: u8) {
        self.roll.update(c);
        let h = u64::from(self.roll.sum());

        for block in &mut self.blocks[self.start..] {
            block.h = sum_hash(c, block.h);
            block.half_h = sum_hash(c, block.half_h);
        }

        let mut i = self.start;
        while i < self.blocks.len() {
            let bs = block_size(i);
            if h % bs != bs - 1 {
                break;
            }
            if self.blocks[i].digest.is_empty() {
                self.try_fork();
            }

            let block = &mut self.blocks[i];
            let ch = B64[(block.h % 64) as usize];
            block.half_tail = Some(B64[(block.half_h % 64) as usize]);
            if block.digest.len() < SPAMSUM_LENGTH - 1 {
                block.digest.push(ch);
                block.tail = None;
                block.h = HASH_INIT;
                if block.digest.len() < HALF_LENGTH {
                    block.half_h = HASH_INIT;
                    block.half_tail = None;
                }
            } else {
                block.tail = Some(ch);
                self.try_reduce();
            }
            i += 1;
        }
    }

    /// Open the next block size once the current largest one starts producing output.
    fn try_fork(&mut self) {
        if self.blocks.len() >= NUM_BLOCKHASHES {
            return;
        }
        let (h, half_h) = match self.blocks.last() {
            Some(last) => (last.h, last.half_h),
            None => (HASH_INIT, HASH_INIT),
        };
        self.blocks.push(BlockHash::new(h, half_h));
    }

    /// Stop tracking the smallest block size once it can no longer be chosen.
    fn try_reduce(&mut self) {
        if self.blocks.len() - self.start < 2 {
            return;
        }
        if block_size(self.start) * (SPAMSUM_LENGTH as u64) >= self.total {
            return;
        }
        if self.blocks[self.start + 1].digest.len() < HALF_LENGTH {
            return;
        }
        self.start += 1;
    }

    pub fn finish(self) -> String {
        let end = self.blocks.len();
        let mut bi = self.start;
        while block_size(bi) * (SPAMSUM_LENGTH as u64) < self.total && bi < NUM_BLOCKHASHES - 1 {
            bi += 1;
        }
        while bi >= end {
            bi -= 1;
        }
        while bi > self.start && self.blocks[bi].digest.len() < HALF_LENGTH {
            bi -= 1;
        }

        let rolling = self.roll.sum();
        let block = &self.blocks[bi];
        let mut first = String::from_utf8_lossy(&block.digest).into_owned();
        if rolling != 0 {
            first.push(B64[(block.h % 64) as usize] as char);
        } else if let Some(tail) = block.tail {
            first.push(tail as char);
        }

        let mut second = String::new();
        if bi + 1 < end {
            let next = &self.blocks[bi + 1];
            let take = next.digest.len().min(HALF_LENGTH - 1);
            second.push_str(&String::from_utf8_lossy(&next.digest[..take]));
            if rolling != 0 {
                second.push(B64[(next.half_h % 64) as usize] as char);
            } else if let Some(half_tail) = next.half_tail {
                second.push(half_tail as char);
            }
        } else if rolling != 0 {
            second.push(B64[(block.h % 64) as usize] as char);
        }

        format!("{}:{}:{}", block_size(bi), first, second)
    }
}

/// Digest a complete buffer.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = CtphHasher::new();
    hasher.update(data);
    hasher.finish()
}

struct ParsedDigest<'a> {
    block_size: u64,
    first: &'a str,
    second: &'a str,
}

fn parse(digest: &str) -> Option<ParsedDigest<'_>> {
    let mut parts = digest.splitn(3, ':');
    let block_size = parts.next()?.parse::<u64>().ok()?;
    let first = parts.next()?;
    let second = parts.next()?;
    // no hasher state produces sizes outside this range
    if block_size == 0 || block_size > MAX_BLOCKSIZE {
        return None;
    }
    Some(ParsedDigest {
        block_size,
        first,
        second,
    })
}

/// Collapse runs of more than three identical characters; they carry little signal.
fn eliminate_sequences(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    for (i, &b) in bytes.iter().enumerate() {
        if i >= 3 && b == bytes[i - 1] && b == bytes[i - 2] && b == bytes[i - 3] {
            continue;
        }
        out.push(b);
    }
    out
}

fn has_common_substring(a: &[u8], b: &[u8]) -> bool {
    if a.len() < ROLLING_WINDOW || b.len() < ROLLING_WINDOW {
        return false;
    }
    a.windows(ROLLING_WINDOW)
        .any(|needle| b.windows(ROLLING_WINDOW).any(|w| w == needle))
}

/// Weighted edit distance: insert and delete cost 1, substitution costs 2.
fn edit_distance(a: &[u8], b: &[u8]) -> u32 {
    let mut prev: Vec<u32> = (0..=b.len() as u32).collect();
    let mut curr = vec![0u32; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i as u32 + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + if ca == cb { 0 } else { 2 };
            let deletion = prev[j + 1] + 1;
            let insertion = curr[j] + 1;
            curr[j + 1] = substitution.min(deletion).min(insertion);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn score_strings(a: &[u8], b: &[u8], block_size: u64) -> u32 {
    if a.len() > SPAMSUM_LENGTH || b.len() > SPAMSUM_LENGTH {
        return 0;
    }
    if !has_common_substring(a, b) {
        return 0;
    }

    let len_sum = (a.len() + b.len()) as u32;
    let mut score = edit_distance(a, b) * SPAMSUM_LENGTH as u32 / len_sum;
    score = 100 * score / SPAMSUM_LENGTH as u32;
    if score >= 100 {
        return 0;
    }
    score = 100 - score;

    let uncapped_from = (99 + ROLLING_WINDOW as u64) / ROLLING_WINDOW as u64 * MIN_BLOCKSIZE;
    if block_size >= uncapped_from {
        return score;
    }
    let cap = (block_size / MIN_BLOCKSIZE) as u32 * a.len().min(b.len()) as u32;
    score.min(cap)
}

/// Similarity of two digests on a 0-100 scale. `None` if either digest is malformed.
pub fn compare(a: &str, b: &str) -> Option<u32> {
    let a = parse(a)?;
    let b = parse(b)?;

    if a.block_size != b.block_size
        && a.block_size != b.block_size * 2
        && b.block_size != a.block_size * 2
    {
        return Some(0);
    }

    let a1 = eliminate_sequences(a.first);
    let a2 = eliminate_sequences(a.second);
    let b1 = eliminate_sequences(b.first);
    let b2 = eliminate_sequences(b.second);

    if a.block_size == b.block_size && a1 == b1 {
        return Some(100);
    }

    let score = if a.block_size == b.block_size {
        score_strings(&a1, &b1, a.block_size).max(score_strings(&a2, &b2, a.block_size * 2))
    } else if a.block_size == b.block_size * 2 {
        score_strings(&a1, &b2, a.block_size)
    } else {
        score_strings(&a2, &b1, b.block_size)
    };
    Some(score)
}
