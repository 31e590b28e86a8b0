//! Digest algorithms used for segment hashing.
//!
//! Segment digests travel as base64 strings tagged with an algorithm name,
//! so both sides of a comparison must agree on [`HashAlgorithm`] before
//! their digests are comparable.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ForkpointError, Result};

/// Read buffer used when digesting readers.
const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

/// Content hash algorithm for segment digests.
///
/// # Example
///
/// ```rust
/// use forkpoint::HashAlgorithm;
///
/// let algorithm: HashAlgorithm = "sha256".parse().unwrap();
/// assert_eq!(algorithm.name(), "SHA256");
/// assert_eq!(algorithm.digest(b"abc"), algorithm.digest(b"abc"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// BLAKE3, 256-bit output.
    #[default]
    Blake3,
    /// SHA-256.
    Sha256,
}

impl HashAlgorithm {
    /// Every supported algorithm.
    pub const ALL: [Self; 2] = [Self::Blake3, Self::Sha256];

    /// Canonical wire name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Blake3 => "BLAKE3",
            Self::Sha256 => "SHA256",
        }
    }

    /// Parse a wire name, ignoring ASCII case and a `-` separator.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedAlgorithm` for unknown names.
    pub fn from_name(name: &str) -> Result<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.name() == normalized)
            .ok_or_else(|| ForkpointError::UnsupportedAlgorithm(name.to_string()))
    }

    /// Start a streaming digest.
    #[must_use]
    pub fn hasher(self) -> StreamDigest {
        let inner = match self {
            Self::Blake3 => DigestState::Blake3(Box::new(blake3::Hasher::new())),
            Self::Sha256 => DigestState::Sha256(Sha256::new()),
        };
        StreamDigest { inner }
    }

    /// Digest a byte slice and return it base64 encoded.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize_base64()
    }

    /// Digest everything a reader yields until it returns 0.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails.
    pub fn digest_reader<R: Read>(self, reader: &mut R) -> std::io::Result<String> {
        let mut hasher = self.hasher();
        let mut buffer = vec![0u8; DIGEST_BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hasher.finalize_base64())
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = ForkpointError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

enum DigestState {
    Blake3(Box<blake3::Hasher>),
    Sha256(Sha256),
}

/// Incremental digest for one algorithm.
pub struct StreamDigest {
    inner: DigestState,
}

impl StreamDigest {
    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            DigestState::Blake3(hasher) => {
                hasher.update(data);
            }
            DigestState::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Finish and return the raw digest bytes.
    #[must_use]
    pub fn finalize(self) -> Vec<u8> {
        match self.inner {
            DigestState::Blake3(hasher) => hasher.finalize().as_bytes().to_vec(),
            DigestState::Sha256(hasher) => hasher.finalize().to_vec(),
        }
    }

    /// Finish and return the digest base64 encoded.
    #[must_use]
    pub fn finalize_base64(self) -> String {
        STANDARD.encode(self.finalize())
    }
}

impl fmt::Debug for StreamDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.inner {
            DigestState::Blake3(_) => HashAlgorithm::Blake3,
            DigestState::Sha256(_) => HashAlgorithm::Sha256,
        };
        write!(f, "StreamDigest({name})")
    }
}
