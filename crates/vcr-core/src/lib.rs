//! Core library for the verifiable code reports service.
//!
//! This crate holds everything that is pure and shared between the daemon and
//! any future tooling:
//!
//! - **Input sanitization**: validation of addresses, repository URLs, git
//!   refs, and image digests before they reach a shell, the network, or
//!   storage.
//! - **Report schema**: the structured trust-analysis report produced by the
//!   external analyzer.
//! - **Attestation**: content hashing, type-tagged commitment packing,
//!   ed25519 signing, and independent bundle verification.
//! - **Configuration**: typed TOML configuration for the daemon.

pub mod attest;
pub mod config;
pub mod hash;
pub mod report;
pub mod sanitize;
