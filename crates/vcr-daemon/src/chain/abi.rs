//! Minimal ABI encoding and decoding for the app registry contract.
//!
//! Only the shapes this service actually touches are implemented: encoding a
//! single-address call, and decoding the `AppUpgraded` event payload down to
//! its release artifacts. Every offset read is bounds-checked; a malformed
//! payload yields an [`AbiError`], never a panic or an out-of-range slice.
//!
//! `AppUpgraded(address indexed app, uint256 rmsReleaseId, release)` where
//! `release = ((artifacts[], upgradeByTime), publicEnv, encryptedEnv)` and
//! each artifact is `(bytes32 digest, string registry)`.

use thiserror::Error;
use vcr_core::hash::keccak256;

/// Word size of the ABI encoding.
const WORD: usize = 32;

/// Canonical signature of the release event.
pub const APP_UPGRADED_SIGNATURE: &str =
    "AppUpgraded(address,uint256,(((bytes32,string)[],uint32),bytes,bytes))";

/// Errors produced while decoding ABI payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AbiError {
    /// An offset or length points outside the payload.
    #[error("abi payload truncated at offset {0}")]
    Truncated(usize),

    /// A length or offset word does not fit in usize.
    #[error("abi length word overflows")]
    Overflow,

    /// A string field is not valid UTF-8.
    #[error("abi string is not valid utf-8")]
    InvalidUtf8,

    /// The hex payload itself is malformed.
    #[error("malformed hex payload: {0}")]
    MalformedHex(String),
}

/// One release artifact from an `AppUpgraded` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// The raw 32-byte image digest.
    pub digest: [u8; 32],
    /// The registry the artifact is published to.
    pub registry: String,
}

impl Artifact {
    /// Renders the raw digest in the `sha256:<hex>` form used everywhere
    /// downstream.
    #[must_use]
    pub fn image_digest(&self) -> String {
        format!("sha256:{}", hex::encode(self.digest))
    }
}

/// Decoded payload of one `AppUpgraded` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppUpgradedPayload {
    pub release_id: u64,
    pub artifacts: Vec<Artifact>,
    pub upgrade_by_time: u32,
}

/// Computes the 4-byte function selector for a canonical signature.
#[must_use]
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Computes `topic0` for the `AppUpgraded` event.
#[must_use]
pub fn app_upgraded_topic0() -> String {
    format!("0x{}", hex::encode(keccak256(APP_UPGRADED_SIGNATURE.as_bytes())))
}

/// Left-pads a 20-byte address into a 32-byte topic value.
///
/// # Errors
///
/// Returns [`AbiError::MalformedHex`] if the address is not 20 bytes of hex.
pub fn address_topic(address: &str) -> Result<String, AbiError> {
    let raw = decode_address(address)?;
    Ok(format!("0x{}{}", "0".repeat(24), hex::encode(raw)))
}

/// Encodes a call taking a single `address` argument.
///
/// # Errors
///
/// Returns [`AbiError::MalformedHex`] if the address is not 20 bytes of hex.
pub fn encode_address_call(signature: &str, address: &str) -> Result<String, AbiError> {
    let raw = decode_address(address)?;
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&selector(signature));
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(&raw);
    Ok(format!("0x{}", hex::encode(data)))
}

fn decode_address(address: &str) -> Result<[u8; 20], AbiError> {
    let raw = hex::decode(address.trim_start_matches("0x"))
        .map_err(|_| AbiError::MalformedHex(address.to_string()))?;
    raw.try_into()
        .map_err(|_| AbiError::MalformedHex(address.to_string()))
}

/// Decodes a single uint-valued `eth_call` result into a u64.
///
/// # Errors
///
/// Returns an error if the result is not one word or the value exceeds u64.
pub fn decode_uint_result(result_hex: &str) -> Result<u64, AbiError> {
    let raw = hex::decode(result_hex.trim_start_matches("0x"))
        .map_err(|_| AbiError::MalformedHex(result_hex.to_string()))?;
    if raw.len() != WORD {
        return Err(AbiError::Truncated(raw.len()));
    }
    word_to_u64(&raw)
}

fn word_to_u64(word: &[u8]) -> Result<u64, AbiError> {
    if word[..WORD - 8].iter().any(|b| *b != 0) {
        return Err(AbiError::Overflow);
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&word[WORD - 8..]);
    Ok(u64::from_be_bytes(bytes))
}

/// Bounds-checked view over an ABI data section.
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn word(&self, offset: usize) -> Result<&'a [u8], AbiError> {
        let end = offset.checked_add(WORD).ok_or(AbiError::Overflow)?;
        self.data.get(offset..end).ok_or(AbiError::Truncated(offset))
    }

    fn u64_at(&self, offset: usize) -> Result<u64, AbiError> {
        word_to_u64(self.word(offset)?)
    }

    /// Reads an offset word and resolves it relative to `base`.
    fn offset_at(&self, offset: usize, base: usize) -> Result<usize, AbiError> {
        let relative = usize::try_from(self.u64_at(offset)?).map_err(|_| AbiError::Overflow)?;
        base.checked_add(relative).ok_or(AbiError::Overflow)
    }

    fn bytes32_at(&self, offset: usize) -> Result<[u8; 32], AbiError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.word(offset)?);
        Ok(out)
    }

    fn string_at(&self, offset: usize) -> Result<String, AbiError> {
        let len = usize::try_from(self.u64_at(offset)?).map_err(|_| AbiError::Overflow)?;
        let start = offset.checked_add(WORD).ok_or(AbiError::Overflow)?;
        let end = start.checked_add(len).ok_or(AbiError::Overflow)?;
        let raw = self.data.get(start..end).ok_or(AbiError::Truncated(start))?;
        String::from_utf8(raw.to_vec()).map_err(|_| AbiError::InvalidUtf8)
    }
}

/// Decodes the data section of an `AppUpgraded` log entry.
///
/// # Errors
///
/// Returns an [`AbiError`] on any truncated or malformed payload.
pub fn decode_app_upgraded(data_hex: &str) -> Result<AppUpgradedPayload, AbiError> {
    let raw = hex::decode(data_hex.trim_start_matches("0x"))
        .map_err(|_| AbiError::MalformedHex("event data".to_string()))?;
    let cursor = Cursor { data: &raw };

    // Argument layout: [rmsReleaseId][offset(release)].
    let release_id = cursor.u64_at(0)?;
    let release_base = cursor.offset_at(WORD, 0)?;

    // release = (rmsRelease, publicEnv, encryptedEnv); all three dynamic.
    let rms_base = cursor.offset_at(release_base, release_base)?;

    // rmsRelease = (artifacts[], upgradeByTime).
    let artifacts_base = cursor.offset_at(rms_base, rms_base)?;
    let time_slot = rms_base.checked_add(WORD).ok_or(AbiError::Overflow)?;
    let upgrade_by_time =
        u32::try_from(cursor.u64_at(time_slot)?).map_err(|_| AbiError::Overflow)?;

    let count = usize::try_from(cursor.u64_at(artifacts_base)?).map_err(|_| AbiError::Overflow)?;
    // One offset word per element must fit in the payload; rejects absurd
    // length words before the loop allocates anything.
    if count > raw.len() / WORD {
        return Err(AbiError::Overflow);
    }

    let elements_base = artifacts_base.checked_add(WORD).ok_or(AbiError::Overflow)?;
    let mut artifacts = Vec::with_capacity(count);
    for index in 0..count {
        let element_slot = index
            .checked_mul(WORD)
            .and_then(|rel| elements_base.checked_add(rel))
            .ok_or(AbiError::Overflow)?;
        let artifact_base = cursor.offset_at(element_slot, elements_base)?;
        let digest = cursor.bytes32_at(artifact_base)?;
        let registry_slot = artifact_base.checked_add(WORD).ok_or(AbiError::Overflow)?;
        let registry_base = cursor.offset_at(registry_slot, artifact_base)?;
        let registry = cursor.string_at(registry_base)?;
        artifacts.push(Artifact { digest, registry });
    }

    Ok(AppUpgradedPayload {
        release_id,
        artifacts,
        upgrade_by_time,
    })
}
