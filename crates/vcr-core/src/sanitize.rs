//! Validation and normalization of externally sourced strings.
//!
//! Everything that arrives from the chain, the build-info resolver, or an
//! operator request passes through here before it can reach a subprocess
//! argument, a network call, or a storage row. Each function either returns
//! the normalized form or a [`SanitizeError`]; nothing is silently repaired.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::hash::keccak256;

/// Maximum accepted repository URL length.
pub const MAX_REPO_URL_LEN: usize = 2048;

/// Maximum accepted git ref length.
pub const MAX_GIT_REF_LEN: usize = 256;

/// Errors produced by input sanitization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SanitizeError {
    /// The address is not a valid 20-byte hex address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The address has mixed case but fails the EIP-55 checksum.
    #[error("address checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// The repository URL is not an acceptable HTTPS git URL.
    #[error("repo url must be an HTTPS git URL, got: {0}")]
    InvalidRepoUrl(String),

    /// The repository URL exceeds the length limit.
    #[error("repo url exceeds {MAX_REPO_URL_LEN} characters")]
    RepoUrlTooLong,

    /// The git ref is empty, too long, or contains forbidden characters.
    #[error("invalid git ref: {0}")]
    InvalidGitRef(String),

    /// The image digest is not `sha256:` followed by 64 hex characters.
    #[error("invalid image digest: {0}")]
    InvalidImageDigest(String),
}

/// Allows any HTTPS git host since URLs come from a trusted build system,
/// not end users. SSH, file://, and shell metacharacters stay blocked.
static HTTPS_GIT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://[\w.-]+(:\d+)?/[\w.@:/-]+(\.git)?$").expect("static pattern")
});

static GIT_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/-]+$").expect("static pattern"));

static IMAGE_DIGEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sha256:[a-f0-9]{64}$").expect("static pattern"));

/// Validates an Ethereum address and returns its EIP-55 checksummed form.
///
/// All-lowercase and all-uppercase inputs are accepted and re-checksummed;
/// mixed-case inputs must already carry the correct checksum.
///
/// # Errors
///
/// Returns [`SanitizeError::InvalidAddress`] for malformed input and
/// [`SanitizeError::ChecksumMismatch`] for a failed checksum.
pub fn sanitize_address(input: &str) -> Result<String, SanitizeError> {
    let trimmed = input.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .ok_or_else(|| SanitizeError::InvalidAddress(truncate(trimmed)))?;

    if hex_part.len() != 40 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(SanitizeError::InvalidAddress(truncate(trimmed)));
    }

    let checksummed = checksum_address(hex_part);

    let uniform_case = hex_part.bytes().all(|b| !b.is_ascii_uppercase())
        || hex_part.bytes().all(|b| !b.is_ascii_lowercase());
    if !uniform_case && trimmed != checksummed {
        return Err(SanitizeError::ChecksumMismatch(truncate(trimmed)));
    }

    Ok(checksummed)
}

/// Computes the EIP-55 checksummed form of a 40-char hex address body.
///
/// A hex digit is uppercased when the corresponding nibble of
/// `keccak256(lowercase_body)` is `>= 8`.
#[must_use]
pub fn checksum_address(hex_part: &str) -> String {
    let lower = hex_part.to_ascii_lowercase();
    let digest = keccak256(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, ch) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            digest[i / 2] >> 4
        } else {
            digest[i / 2] & 0x0f
        };
        if ch.is_ascii_alphabetic() && nibble >= 8 {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Validates a git repository URL from the trusted build system.
///
/// # Errors
///
/// Returns an error if the URL is too long or is not an HTTPS git URL.
pub fn sanitize_repo_url(input: &str) -> Result<String, SanitizeError> {
    let trimmed = input.trim();
    if trimmed.len() > MAX_REPO_URL_LEN {
        return Err(SanitizeError::RepoUrlTooLong);
    }
    if !HTTPS_GIT_URL.is_match(trimmed) {
        return Err(SanitizeError::InvalidRepoUrl(truncate(trimmed)));
    }
    Ok(trimmed.to_string())
}

/// Validates a git ref (commit SHA, branch, or tag).
///
/// Only alphanumerics, hyphens, underscores, dots, and slashes are allowed,
/// and `..` is rejected outright.
///
/// # Errors
///
/// Returns [`SanitizeError::InvalidGitRef`] on any violation.
pub fn sanitize_git_ref(input: &str) -> Result<String, SanitizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_GIT_REF_LEN {
        return Err(SanitizeError::InvalidGitRef(truncate(trimmed)));
    }
    if !GIT_REF.is_match(trimmed) || trimmed.contains("..") {
        return Err(SanitizeError::InvalidGitRef(truncate(trimmed)));
    }
    Ok(trimmed.to_string())
}

/// Validates an image digest and returns it lowercased.
///
/// # Errors
///
/// Returns [`SanitizeError::InvalidImageDigest`] unless the input is
/// `sha256:` followed by exactly 64 hex characters.
pub fn sanitize_image_digest(input: &str) -> Result<String, SanitizeError> {
    let normalized = input.trim().to_ascii_lowercase();
    if !IMAGE_DIGEST.is_match(&normalized) {
        return Err(SanitizeError::InvalidImageDigest(truncate(input.trim())));
    }
    Ok(normalized)
}

/// Clamps a pagination offset to a non-negative value.
#[must_use]
pub fn sanitize_offset(input: Option<&str>) -> u32 {
    input
        .and_then(|raw| raw.parse::<u32>().ok())
        .unwrap_or(0)
}

/// Clamps a pagination limit to the `1..=max` range, falling back to
/// `default` on absent or unparseable input.
#[must_use]
pub fn sanitize_limit(input: Option<&str>, max: u32, default: u32) -> u32 {
    match input.and_then(|raw| raw.parse::<u32>().ok()) {
        Some(n) if n >= 1 => n.min(max),
        _ => default,
    }
}

/// Keeps error messages bounded when echoing back hostile input.
fn truncate(input: &str) -> String {
    const MAX: usize = 100;
    if input.len() > MAX {
        format!("{}...", &input[..MAX])
    } else {
        input.to_string()
    }
}
