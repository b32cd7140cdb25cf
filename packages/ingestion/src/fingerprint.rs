//! 64-bit SimHash content fingerprints.
//!
//! Near-duplicate documents produce fingerprints that differ in only a few
//! bits, so the Hamming distance between the stored fingerprint and a freshly
//! fetched document decides whether the content is re-persisted.
//!
//! Algorithm:
//! - lower-case the document and split it into `\b\w+\b` tokens
//! - hash each token with MD5, keep the first 8 digest bytes (big-endian)
//! - per bit, add +1 when the token hash has it set and -1 otherwise
//! - the fingerprint bit is set when its running sum is positive

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Distances at or below this are treated as unchanged content.
pub const SIMILARITY_THRESHOLD: u32 = 3;

const BITS: usize = 64;

lazy_static! {
    static ref TOKEN_REGEX: Regex = Regex::new(r"\b\w+\b").unwrap();
}

/// A 64-bit SimHash of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint raw document bytes (decoded as lossy UTF-8).
    pub fn of(content: &[u8]) -> Self {
        Self::of_text(&String::from_utf8_lossy(content))
    }

    /// Fingerprint already-decoded text. Text without tokens hashes to zero.
    pub fn of_text(text: &str) -> Self {
        if text.is_empty() {
            return Self(0);
        }

        let lowered = text.to_lowercase();
        let mut weights = [0i64; BITS];
        let mut saw_token = false;

        for token in TOKEN_REGEX.find_iter(&lowered) {
            saw_token = true;
            let hash = token_hash(token.as_str());
            for (bit, weight) in weights.iter_mut().enumerate() {
                if hash & (1u64 << bit) != 0 {
                    *weight += 1;
                } else {
                    *weight -= 1;
                }
            }
        }

        if !saw_token {
            return Self(0);
        }

        let bits = weights
            .iter()
            .enumerate()
            .filter(|(_, weight)| **weight > 0)
            .fold(0u64, |acc, (bit, _)| acc | (1u64 << bit));

        Self(bits)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Bit pattern as a signed 64-bit integer, for BIGINT columns.
    pub fn to_i64(&self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    /// Number of differing bits.
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        hamming_distance(self.0, other.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Count of differing bits between two 64-bit values.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Whether two fingerprints describe the same content.
///
/// Returns false when either side is missing: a record that was never
/// fingerprinted is always treated as changed.
pub fn is_similar(previous: Option<Fingerprint>, current: Option<Fingerprint>) -> bool {
    match (previous, current) {
        (Some(a), Some(b)) => a.distance(&b) <= SIMILARITY_THRESHOLD,
        _ => false,
    }
}

fn token_hash(token: &str) -> u64 {
    let digest = md5::compute(token.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.0[..8]);
    u64::from_be_bytes(prefix)
}
