//! Data contracts exchanged between the source and target sides.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash::HashAlgorithm;

/// Identifies one logical transfer's full data contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Transfer identifier.
    pub id: String,
    /// Total length in bytes.
    pub length: u64,
    /// Name of the digest algorithm, see [`HashAlgorithm::name`].
    pub hash_algorithm: String,
}

impl StreamDescriptor {
    /// Create a descriptor.
    #[must_use]
    pub fn new(id: impl Into<String>, length: u64, algorithm: HashAlgorithm) -> Self {
        Self {
            id: id.into(),
            length,
            hash_algorithm: algorithm.name().to_string(),
        }
    }

    /// Parse the algorithm name.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedAlgorithm` for unknown names.
    pub fn algorithm(&self) -> Result<HashAlgorithm> {
        HashAlgorithm::from_name(&self.hash_algorithm)
    }
}

/// Digest of one contiguous byte range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHash {
    /// Absolute start offset.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
    /// Base64 digest.
    pub hash: String,
}

impl SegmentHash {
    /// Create a segment digest.
    #[must_use]
    pub fn new(start: u64, length: u64, hash: impl Into<String>) -> Self {
        Self {
            start,
            length,
            hash: hash.into(),
        }
    }
}

/// A digest set together with the range it covers.
///
/// `hashes` is ordered `[whole range, part 0, .., part P-1]`; an empty list
/// asks the other side to fill it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstreamDetails {
    /// Start of the covered range.
    pub start: u64,
    /// Length of the covered range.
    pub length: u64,
    /// Digest algorithm name.
    pub hash_algorithm: String,
    /// Digest set.
    pub hashes: Vec<SegmentHash>,
}

impl SubstreamDetails {
    /// Range request without digests.
    #[must_use]
    pub fn request(start: u64, length: u64, algorithm: HashAlgorithm) -> Self {
        Self {
            start,
            length,
            hash_algorithm: algorithm.name().to_string(),
            hashes: Vec::new(),
        }
    }

    /// Filled digest set for a range.
    #[must_use]
    pub fn with_hashes(
        start: u64,
        length: u64,
        algorithm: HashAlgorithm,
        hashes: Vec<SegmentHash>,
    ) -> Self {
        Self {
            start,
            length,
            hash_algorithm: algorithm.name().to_string(),
            hashes,
        }
    }

    /// Digest of the whole range.
    #[must_use]
    pub fn top_hash(&self) -> Option<&SegmentHash> {
        self.hashes.first()
    }

    /// Sub-partition digests.
    #[must_use]
    pub fn parts(&self) -> &[SegmentHash] {
        self.hashes.get(1..).unwrap_or_default()
    }

    /// Whether the range is `[0, length)`.
    #[must_use]
    pub const fn covers(&self, length: u64) -> bool {
        self.start == 0 && self.length == length
    }
}

/// Unit exchanged to negotiate or resume a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    /// What is being transferred.
    pub descriptor: StreamDescriptor,
    /// Source-side digests.
    pub source: Option<SubstreamDetails>,
    /// Target-side digests, filled by the target.
    pub target: Option<SubstreamDetails>,
}

impl StreamStatus {
    /// Status with source details only.
    #[must_use]
    pub const fn new(descriptor: StreamDescriptor, source: SubstreamDetails) -> Self {
        Self {
            descriptor,
            source: Some(source),
            target: None,
        }
    }

    /// Whether the target holds exactly the described stream.
    ///
    /// True when the target covers `[0, length)` with the descriptor's
    /// algorithm and its whole-range digest equals the source's.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let (Some(source), Some(target)) = (&self.source, &self.target) else {
            return false;
        };
        let same_algorithm = |details: &SubstreamDetails| {
            details
                .hash_algorithm
                .eq_ignore_ascii_case(&self.descriptor.hash_algorithm)
        };
        target.covers(self.descriptor.length)
            && source.covers(self.descriptor.length)
            && same_algorithm(target)
            && same_algorithm(source)
            && matches!(
                (source.top_hash(), target.top_hash()),
                (Some(s), Some(t)) if s.hash == t.hash
            )
    }
}
