//! Keccak-256 hashing primitives.
//!
//! The attestation chain and the Ethereum address checksum both hash with
//! Keccak-256, so the raw primitive lives here rather than inside either
//! consumer.

use sha3::{Digest, Keccak256};

/// Size of a Keccak-256 hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Type alias for a 32-byte hash.
pub type Hash = [u8; HASH_SIZE];

/// Hashes raw content with Keccak-256.
#[must_use]
pub fn keccak256(content: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(content);
    hasher.finalize().into()
}

/// Hex-encodes a hash with a `0x` prefix.
#[must_use]
pub fn to_hex(hash: &Hash) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Parses a `0x`-prefixed 32-byte hex string.
///
/// Returns `None` if the prefix is missing, the length is wrong, or the
/// payload is not hex.
#[must_use]
pub fn from_hex(input: &str) -> Option<Hash> {
    let payload = input.strip_prefix("0x")?;
    let bytes = hex::decode(payload).ok()?;
    bytes.try_into().ok()
}
