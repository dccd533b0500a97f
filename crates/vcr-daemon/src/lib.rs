//! Verifiable code reports daemon.
//!
//! Watches an on-chain application registry for new releases, resolves each
//! released image digest back to its source repository, runs an independent
//! trust analysis of that source, and publishes a signed attestation binding
//! the analysis result to the commit and image digest it covers.
//!
//! Pipeline: [`poller`] → [`resolver`] → [`store`] (build row) → [`scheduler`]
//! → [`fetcher`] → [`analyzer`] → attestation (`vcr_core::attest`) →
//! [`store`] (report row).

pub mod analyzer;
pub mod chain;
pub mod fetcher;
pub mod http;
pub mod poller;
pub mod resolver;
pub mod scheduler;
pub mod store;
