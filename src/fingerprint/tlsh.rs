//! Locality-sensitive digest in the TLSH family.
//!
//! Byte triplets drawn from a sliding 5-byte window are mapped through a
//! Pearson table into 128 buckets. The digest encodes each bucket's quartile
//! plus a checksum, a log-scaled length and two quartile ratios. Distances are
//! additive over those fields; 0 means the same content profile.
//!
//! The Pearson table is generated here, so digests are not interchangeable
//! with reference TLSH output. They carry an `L1` prefix instead of `T1` and
//! reference digests are rejected as malformed.

const WINDOW: usize = 5;
const BUCKETS: usize = 256;
const EFFECTIVE_BUCKETS: usize = 128;
const CODE_SIZE: usize = EFFECTIVE_BUCKETS / 4;
const MIN_DATA_LEN: u64 = 256;
const DIGEST_PREFIX: &str = "L1";
const DIGEST_HEX_LEN: usize = DIGEST_PREFIX.len() + 2 * (3 + CODE_SIZE);

const SALTS: [u8; 6] = [2, 3, 5, 7, 11, 13];

const fn pearson_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = i as u8;
        i += 1;
    }
    let mut state: u32 = 0x9e37_79b9;
    let mut i = 255;
    while i > 0 {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let j = (state % (i as u32 + 1)) as usize;
        let tmp = table[i];
        table[i] = table[j];
        table[j] = tmp;
        i -= 1;
    }
    table
}

static PEARSON: [u8; 256] = pearson_table();

fn b_mapping(salt: u8, i: u8, j: u8, k: u8) -> u8 {
    let mut h = PEARSON[salt as usize];
    h = PEARSON[(h ^ i) as usize];
    h = PEARSON[(h ^ j) as usize];
    PEARSON[(h ^ k) as usize]
}

fn l_capturing(len: u64) -> u8 {
    let len = len as f64;
    let value = if len <= 656.0 {
        (len.ln() / 1.5f64.ln()).floor()
    } else if len <= 3199.0 {
        (len.ln() / 1.3f64.ln() - 8.727_77).floor()
    } else {
        (len.ln() / 1.1f64.ln() - 62.547_2).floor()
    };
    (value as u64 % 256) as u8
}

/// Streaming state; feed bytes with [`TlshHasher::update`].
#[derive(Debug, Clone)]
pub struct TlshHasher {
    buckets: Box<[u32; BUCKETS]>,
    /// Most recent byte first.
    recent: [u8; WINDOW - 1],
    checksum: u8,
    total: u64,
}

impl Default for TlshHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl TlshHasher {
    pub fn new() -> Self {
        Self {
            buckets: Box::new([0; BUCKETS]),
            recent: [0; WINDOW - 1],
            checksum: 0,
            total: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &c in data {
            if self.total >= (WINDOW - 1) as u64 {
                let [w1, w2, w3, w4] = self.recent;
                self.checksum = b_mapping(0, c, w1, self.checksum);
                let triplets = [
                    (c, w1, w2),
                    (c, w1, w3),
                    (c, w2, w3),
                    (c, w2, w4),
                    (c, w1, w4),
                    (c, w3, w4),
                ];
                for (salt, (a, b, d)) in SALTS.iter().zip(triplets) {
                    let bucket = b_mapping(*salt, a, b, d);
                    self.buckets[bucket as usize] += 1;
                }
            }
            self.recent.copy_within(0..WINDOW - 2, 1);
            self.recent[0] = c;
            self.total += 1;
        }
    }

    /// `None` when the input is too short or too uniform to profile.
    pub fn finish(self) -> Option<String> {
        if self.total < MIN_DATA_LEN {
            return None;
        }
        let counts = &self.buckets[..EFFECTIVE_BUCKETS];
        let nonzero = counts.iter().filter(|&&c| c > 0).count();
        if nonzero <= 2 * CODE_SIZE {
            return None;
        }

        let mut sorted = counts.to_vec();
        sorted.sort_unstable();
        let q1 = sorted[EFFECTIVE_BUCKETS / 4 - 1];
        let q2 = sorted[EFFECTIVE_BUCKETS / 2 - 1];
        let q3 = sorted[EFFECTIVE_BUCKETS * 3 / 4 - 1];
        if q3 == 0 {
            return None;
        }

        let mut code = [0u8; CODE_SIZE];
        for (i, slot) in code.iter_mut().enumerate() {
            let mut h = 0u8;
            for j in 0..4 {
                let k = counts[4 * i + j];
                let quartile = if q3 < k {
                    3
                } else if q2 < k {
                    2
                } else if q1 < k {
                    1
                } else {
                    0
                };
                h |= quartile << (j * 2);
            }
            *slot = h;
        }

        let q1_ratio = ((u64::from(q1) * 100 / u64::from(q3)) % 16) as u8;
        let q2_ratio = ((u64::from(q2) * 100 / u64::from(q3)) % 16) as u8;

        let mut raw = Vec::with_capacity(3 + CODE_SIZE);
        raw.push(self.checksum);
        raw.push(l_capturing(self.total));
        raw.push((q1_ratio << 4) | q2_ratio);
        raw.extend_from_slice(&code);
        Some(format!("{}{}", DIGEST_PREFIX, hex::encode_upper(raw)))
    }
}

/// Digest a complete buffer.
pub fn digest(data: &[u8]) -> Option<String> {
    let mut hasher = TlshHasher::new();
    hasher.update(data);
    hasher.finish()
}

struct ParsedDigest {
    checksum: u8,
    lvalue: u8,
    q1_ratio: u8,
    q2_ratio: u8,
    code: Vec<u8>,
}

fn parse(digest: &str) -> Option<ParsedDigest> {
    if digest.len() != DIGEST_HEX_LEN {
        return None;
    }
    let body = digest.strip_prefix(DIGEST_PREFIX)?;
    let raw = hex::decode(body).ok()?;
    Some(ParsedDigest {
        checksum: raw[0],
        lvalue: raw[1],
        q1_ratio: raw[2] >> 4,
        q2_ratio: raw[2] & 0x0f,
        code: raw[3..].to_vec(),
    })
}

fn mod_diff(a: u8, b: u8, range: u32) -> u32 {
    let direct = (i32::from(a) - i32::from(b)).unsigned_abs();
    direct.min(range - direct)
}

/// Distance between two digests; smaller is more similar. `None` if either is malformed.
pub fn distance(a: &str, b: &str) -> Option<u32> {
    let a = parse(a)?;
    let b = parse(b)?;
    let mut diff = 0u32;

    if a.checksum != b.checksum {
        diff += 1;
    }

    diff += match mod_diff(a.lvalue, b.lvalue, 256) {
        0 => 0,
        1 => 1,
        d => d * 12,
    };

    for (x, y) in [(a.q1_ratio, b.q1_ratio), (a.q2_ratio, b.q2_ratio)] {
        let d = mod_diff(x, y, 16);
        diff += if d <= 1 { d } else { (d - 1) * 12 };
    }

    for (x, y) in a.code.iter().zip(&b.code) {
        for shift in (0..8).step_by(2) {
            let px = (x >> shift) & 0b11;
            let py = (y >> shift) & 0b11;
            diff += match px.abs_diff(py) {
                3 => 6,
                d => u32::from(d),
            };
        }
    }
    Some(diff)
}
