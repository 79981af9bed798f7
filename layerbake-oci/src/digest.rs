use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{OciError, Result};

const SHA256_PREFIX: &str = "sha256:";
const SHA256_HEX_LEN: usize = 64;

// ---------------------------------------------------------------------------
// DescriptorDigest
// ---------------------------------------------------------------------------

/// A validated `sha256:<hex>` content address.
///
/// Used both as the registry content address of a blob and as the file name
/// of a cached base-image layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DescriptorDigest {
    hash: String,
}

impl DescriptorDigest {
    /// Build a digest from a bare 64-character lowercase hex hash.
    pub fn from_hash(hash: &str) -> Result<Self> {
        if hash.len() != SHA256_HEX_LEN
            || !hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(OciError::InvalidDigest(format!(
                "invalid sha256 hash: {hash}"
            )));
        }
        Ok(Self {
            hash: hash.to_string(),
        })
    }

    /// Parse an `algorithm:hex` string.  Only `sha256` is supported.
    pub fn from_digest(digest: &str) -> Result<Self> {
        let hash = digest
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| OciError::InvalidDigest(format!("unsupported digest: {digest}")))?;
        Self::from_hash(hash)
    }

    /// Digest of an in-memory byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_sha256_output(&Sha256::digest(data))
    }

    /// Wrap a hex hash produced by our own hasher.
    pub(crate) fn from_sha256_output(bytes: &[u8]) -> Self {
        Self {
            hash: hex_encode(bytes),
        }
    }

    /// The hex portion, without the algorithm prefix.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for DescriptorDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SHA256_PREFIX, self.hash)
    }
}

impl FromStr for DescriptorDigest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_digest(s)
    }
}

impl TryFrom<String> for DescriptorDigest {
    type Error = OciError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_digest(&value)
    }
}

impl From<DescriptorDigest> for String {
    fn from(value: DescriptorDigest) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// BlobDescriptor
// ---------------------------------------------------------------------------

/// Size and digest of exactly the bytes that were written.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobDescriptor {
    pub size: u64,
    pub digest: DescriptorDigest,
}

impl BlobDescriptor {
    pub fn new(size: u64, digest: DescriptorDigest) -> Self {
        Self { size, digest }
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
