//! Cache key generation

use sha2::{Digest, Sha256};
use std::fmt::{self, Write};

const DOMAIN: &[u8] = b"query-cache/v1";

/// Which cache a key addresses; part of the hashed input so plan and
/// result keys never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Plan,
    Result,
}

impl KeyKind {
    pub fn tag(&self) -> &'static str {
        match self {
            KeyKind::Plan => "plan",
            KeyKind::Result => "result",
        }
    }
}

/// Opaque hex-encoded SHA-256 key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl CacheKey {
    pub fn generate(kind: KeyKind, canonical: &str, prefix: &str) -> Self {
        let mut hasher = Sha256::new();
        update_framed(&mut hasher, DOMAIN);
        update_framed(&mut hasher, kind.tag().as_bytes());
        update_framed(&mut hasher, canonical.as_bytes());
        update_framed(&mut hasher, prefix.as_bytes());

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            let _ = write!(hex, "{:02x}", byte);
        }
        CacheKey(hex)
    }

    pub fn plan(shape: &str, prefix: &str) -> Self {
        Self::generate(KeyKind::Plan, shape, prefix)
    }

    pub fn result(text: &str, prefix: &str) -> Self {
        Self::generate(KeyKind::Result, text, prefix)
    }

    /// Wraps a key read back from a reference bucket.
    pub fn from_stored(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
