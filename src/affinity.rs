//! Hash-based upstream affinity
//!
//! `select` maps a request key to one of an ordered candidate list: the first
//! eight bytes of SHA-256(key), read big-endian, modulo the candidate count.
//! The same key and candidate list always pick the same upstream. Changing
//! the size of the list remaps keys; there is no consistent-hashing ring.

use sha2::{Digest, Sha256};
use std::net::SocketAddr;

/// Stable 64-bit hash of `key`
pub fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Pick the candidate for `key`; `None` when there are no candidates
pub fn select<'a, T>(key: &str, candidates: &'a [T]) -> Option<&'a T> {
    if candidates.is_empty() {
        return None;
    }
    let index = (hash_key(key) % candidates.len() as u64) as usize;
    candidates.get(index)
}

/// Which request attribute feeds the affinity hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashSource {
    /// Target host requested by the client
    Host,
    /// Client IP address
    Client,
}

impl HashSource {
    /// Parse the `hash` policy descriptor; unknown or empty means no affinity
    pub fn parse(descriptor: &str) -> Option<Self> {
        match descriptor.trim().to_ascii_lowercase().as_str() {
            "host" => Some(Self::Host),
            "client" => Some(Self::Client),
            _ => None,
        }
    }

    /// Extract the key for this source
    pub fn key(&self, host: Option<&str>, client: Option<SocketAddr>) -> Option<String> {
        match self {
            Self::Host => host.filter(|h| !h.is_empty()).map(str::to_ascii_lowercase),
            Self::Client => client.map(|addr| addr.ip().to_string()),
        }
    }
}
