//! Streaming SHA-256 for downloaded archives.

use crate::error::{LauncherError, Result};
use sha2::{Digest, Sha256};

/// Incremental SHA-256 fed chunk by chunk while an archive streams in.
#[derive(Clone, Default)]
pub struct Sha256Hasher {
    inner: Sha256,
    bytes: u64,
}

impl Sha256Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the digest as lowercase hex.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Compare a computed digest against the published one.
///
/// Comparison ignores case and surrounding whitespace.
pub fn verify(expected: &str, actual: &str) -> Result<()> {
    if expected.trim().eq_ignore_ascii_case(actual.trim()) {
        Ok(())
    } else {
        Err(LauncherError::Checksum {
            expected: expected.trim().to_ascii_lowercase(),
            actual: actual.to_string(),
        })
    }
}
