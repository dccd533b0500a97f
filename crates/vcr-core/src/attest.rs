//! Attestation: content hashing, commitment packing, signing, verification.
//!
//! A signed bundle binds an analysis report and its logs to the signer
//! identity and, when available, to the on-chain provenance of the analyzed
//! build. The commitment is:
//!
//! ```text
//! content_hash = keccak256(canonical_json(report))
//! logs_hash    = keccak256(canonical_json(logs))
//! report_hash  = keccak256(pack(content_hash, logs_hash, timestamp,
//!                               signer_address[, app_address]
//!                               [, keccak256(image_digest)]))
//! signature    = ed25519_sign(report_hash)
//! ```
//!
//! `pack` is a fixed, ordered, type-tagged, length-prefixed concatenation —
//! deliberately not JSON — so differently shaped inputs cannot collide.
//! Canonical JSON here means `serde_json` serialization of a
//! [`serde_json::Value`], whose object keys are sorted, making the byte
//! stream deterministic for any party recomputing the hashes.
//!
//! Verification is a pure function of the bundle plus the expected signer
//! identity; see [`verify_bundle`].

use chrono::Utc;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hash::{self, Hash, keccak256};
use crate::sanitize::checksum_address;

/// Attestation schema version.
pub const ATTESTATION_VERSION: u32 = 1;

// Field tags for the packed commitment. Order and values are fixed forever;
// changing either breaks verification of existing attestations.
const TAG_CONTENT_HASH: u8 = 0x01;
const TAG_LOGS_HASH: u8 = 0x02;
const TAG_TIMESTAMP: u8 = 0x03;
const TAG_SIGNER_ADDRESS: u8 = 0x04;
const TAG_APP_ADDRESS: u8 = 0x05;
const TAG_IMAGE_DIGEST_HASH: u8 = 0x06;

/// Errors that can occur while producing an attestation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttestError {
    /// The signing key seed is not 32 bytes of hex.
    #[error("invalid signing key seed: {0}")]
    InvalidSeed(String),

    /// Report or log serialization failed.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors that can occur while verifying a bundle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerifyError {
    /// Recomputed content hash differs from the embedded one.
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    ContentHashMismatch { expected: String, actual: String },

    /// Recomputed logs hash differs from the embedded one.
    #[error("logs hash mismatch: expected {expected}, got {actual}")]
    LogsHashMismatch { expected: String, actual: String },

    /// Recomputed report hash differs from the embedded one.
    #[error("report hash mismatch: expected {expected}, got {actual}")]
    ReportHashMismatch { expected: String, actual: String },

    /// An embedded hash field is not valid 0x-prefixed 32-byte hex.
    #[error("malformed hash field: {0}")]
    MalformedHash(&'static str),

    /// The embedded public key is malformed.
    #[error("malformed signer public key")]
    MalformedPublicKey,

    /// The embedded signature is malformed.
    #[error("malformed signature")]
    MalformedSignature,

    /// The signature does not verify over the report hash.
    #[error("signature does not verify over report hash")]
    SignatureInvalid,

    /// The address derived from the embedded public key does not match the
    /// embedded or expected signer address.
    #[error("signer mismatch: expected {expected}, derived {derived}")]
    SignerMismatch { expected: String, derived: String },

    /// Bundle serialization failed while recomputing hashes.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// The enclave-held signing identity.
pub struct AttestSigner {
    key: SigningKey,
    address: String,
}

impl AttestSigner {
    /// Constructs a signer from a 32-byte hex seed.
    ///
    /// # Errors
    ///
    /// Returns [`AttestError::InvalidSeed`] if the seed is not 64 hex chars.
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, AttestError> {
        let raw = hex::decode(seed_hex.trim().trim_start_matches("0x"))
            .map_err(|_| AttestError::InvalidSeed("not hex".to_string()))?;
        let seed: [u8; 32] = raw
            .try_into()
            .map_err(|_| AttestError::InvalidSeed("seed must be 32 bytes".to_string()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    /// Generates a fresh random signer.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self::from_signing_key(SigningKey::generate(&mut rng))
    }

    fn from_signing_key(key: SigningKey) -> Self {
        let address = derive_address(&key.verifying_key());
        Self { key, address }
    }

    /// The checksummed signer address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Hex-encoded seed, for `keygen` output only.
    #[must_use]
    pub fn seed_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Hex-encoded verifying key with a `0x` prefix.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.key.verifying_key().to_bytes()))
    }

    fn sign(&self, message: &Hash) -> Signature {
        self.key.sign(message)
    }
}

/// Derives the checksummed signer address from a verifying key: the last 20
/// bytes of `keccak256(key_bytes)`, Ethereum-style.
#[must_use]
pub fn derive_address(key: &VerifyingKey) -> String {
    let digest = keccak256(key.as_bytes());
    checksum_address(&hex::encode(&digest[12..]))
}

/// On-chain provenance metadata folded into the commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// Checksummed application address.
    pub app_address: String,
    /// The `sha256:...` image digest of the released artifact.
    pub image_digest: String,
    /// Block the release event was observed at.
    pub block_number: Option<u64>,
    /// Whether the digest-to-source mapping was cryptographically confirmed.
    pub verified: bool,
}

/// The attestation record embedded in a signed bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub version: u32,
    /// `keccak256` of the packed commitment, 0x-prefixed hex.
    pub report_hash: String,
    pub content_hash: String,
    pub logs_hash: String,
    /// Unix timestamp (seconds) of signing.
    pub timestamp: i64,
    pub signer_address: String,
    /// The ed25519 verifying key, 0x-prefixed hex. Required for independent
    /// verification since ed25519 signatures do not support key recovery.
    pub signer_public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance_verified: Option<bool>,
}

/// A complete signed attestation bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBundle {
    /// The analysis report as emitted by the analyzer.
    pub report: Value,
    /// The accumulated analysis logs.
    pub logs: Value,
    pub attestation: Attestation,
    /// Ed25519 signature over `report_hash`, 0x-prefixed hex.
    pub signature: String,
}

/// Hashes a JSON value canonically (sorted object keys).
fn hash_json(value: &Value) -> Result<Hash, serde_json::Error> {
    Ok(keccak256(&serde_json::to_vec(value)?))
}

fn pack_field(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&u32::try_from(payload.len()).unwrap_or(u32::MAX).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Packs the commitment fields into the fixed byte layout and hashes it.
fn compute_report_hash(
    content_hash: &Hash,
    logs_hash: &Hash,
    timestamp: i64,
    signer_address: &str,
    provenance: Option<&Provenance>,
) -> Hash {
    let mut packed = Vec::with_capacity(128);
    pack_field(&mut packed, TAG_CONTENT_HASH, content_hash);
    pack_field(&mut packed, TAG_LOGS_HASH, logs_hash);
    pack_field(&mut packed, TAG_TIMESTAMP, &timestamp.to_be_bytes());
    pack_field(&mut packed, TAG_SIGNER_ADDRESS, signer_address.as_bytes());
    if let Some(p) = provenance {
        pack_field(&mut packed, TAG_APP_ADDRESS, p.app_address.as_bytes());
        pack_field(
            &mut packed,
            TAG_IMAGE_DIGEST_HASH,
            &keccak256(p.image_digest.as_bytes()),
        );
    }
    keccak256(&packed)
}

/// Signs a report and its logs, producing a verifiable bundle.
///
/// # Errors
///
/// Returns [`AttestError::Serialize`] if the report or logs cannot be
/// serialized.
pub fn sign_report(
    signer: &AttestSigner,
    report: &crate::report::Report,
    logs: &Value,
    provenance: Option<Provenance>,
) -> Result<SignedBundle, AttestError> {
    let report_value = serde_json::to_value(report)?;
    let content_hash = hash_json(&report_value)?;
    let logs_hash = hash_json(logs)?;
    let timestamp = Utc::now().timestamp();

    let report_hash = compute_report_hash(
        &content_hash,
        &logs_hash,
        timestamp,
        signer.address(),
        provenance.as_ref(),
    );
    let signature = signer.sign(&report_hash);

    let attestation = Attestation {
        version: ATTESTATION_VERSION,
        report_hash: hash::to_hex(&report_hash),
        content_hash: hash::to_hex(&content_hash),
        logs_hash: hash::to_hex(&logs_hash),
        timestamp,
        signer_address: signer.address().to_string(),
        signer_public_key: signer.public_key_hex(),
        app_address: provenance.as_ref().map(|p| p.app_address.clone()),
        image_digest: provenance.as_ref().map(|p| p.image_digest.clone()),
        block_number: provenance.as_ref().and_then(|p| p.block_number),
        provenance_verified: provenance.as_ref().map(|p| p.verified),
    };

    Ok(SignedBundle {
        report: report_value,
        logs: logs.clone(),
        attestation,
        signature: format!("0x{}", hex::encode(signature.to_bytes())),
    })
}

/// Independently verifies a signed bundle against an expected signer.
///
/// Recomputes the content and logs hashes from the embedded report and logs,
/// recomputes the report hash from the embedded attestation fields, derives
/// the signer address from the embedded public key, and checks the signature
/// over the report hash. Every recomputed value must match its embedded
/// counterpart, and the derived address must equal both the embedded and the
/// expected signer address.
///
/// # Errors
///
/// Returns the first mismatch encountered as a [`VerifyError`].
pub fn verify_bundle(bundle: &SignedBundle, expected_signer: &str) -> Result<(), VerifyError> {
    let att = &bundle.attestation;

    let content_hash =
        hash_json(&bundle.report).map_err(|e| VerifyError::Serialize(e.to_string()))?;
    let embedded_content =
        hash::from_hex(&att.content_hash).ok_or(VerifyError::MalformedHash("contentHash"))?;
    if content_hash != embedded_content {
        return Err(VerifyError::ContentHashMismatch {
            expected: att.content_hash.clone(),
            actual: hash::to_hex(&content_hash),
        });
    }

    let logs_hash = hash_json(&bundle.logs).map_err(|e| VerifyError::Serialize(e.to_string()))?;
    let embedded_logs =
        hash::from_hex(&att.logs_hash).ok_or(VerifyError::MalformedHash("logsHash"))?;
    if logs_hash != embedded_logs {
        return Err(VerifyError::LogsHashMismatch {
            expected: att.logs_hash.clone(),
            actual: hash::to_hex(&logs_hash),
        });
    }

    let provenance = att.app_address.as_ref().zip(att.image_digest.as_ref()).map(
        |(app_address, image_digest)| Provenance {
            app_address: app_address.clone(),
            image_digest: image_digest.clone(),
            block_number: att.block_number,
            verified: att.provenance_verified.unwrap_or(false),
        },
    );
    let report_hash = compute_report_hash(
        &content_hash,
        &logs_hash,
        att.timestamp,
        &att.signer_address,
        provenance.as_ref(),
    );
    let embedded_report_hash =
        hash::from_hex(&att.report_hash).ok_or(VerifyError::MalformedHash("reportHash"))?;
    if report_hash != embedded_report_hash {
        return Err(VerifyError::ReportHashMismatch {
            expected: att.report_hash.clone(),
            actual: hash::to_hex(&report_hash),
        });
    }

    let key_bytes = hex::decode(att.signer_public_key.trim_start_matches("0x"))
        .map_err(|_| VerifyError::MalformedPublicKey)?;
    let key_array: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| VerifyError::MalformedPublicKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_array).map_err(|_| VerifyError::MalformedPublicKey)?;

    let derived = derive_address(&verifying_key);
    if derived != att.signer_address || derived != expected_signer {
        return Err(VerifyError::SignerMismatch {
            expected: expected_signer.to_string(),
            derived,
        });
    }

    let sig_bytes = hex::decode(bundle.signature.trim_start_matches("0x"))
        .map_err(|_| VerifyError::MalformedSignature)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| VerifyError::MalformedSignature)?;
    verifying_key
        .verify(&report_hash, &signature)
        .map_err(|_| VerifyError::SignatureInvalid)?;

    Ok(())
}
