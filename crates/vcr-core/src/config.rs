//! Daemon configuration.
//!
//! Parsed from a TOML file with per-field defaults; every section can be
//! omitted. The signing key seed is deliberately not part of the file — it is
//! read from the `VCR_SIGNER_KEY` environment variable at startup so that
//! config files can be committed without holding secrets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding the hex-encoded 32-byte signing key seed.
pub const SIGNER_KEY_ENV: &str = "VCR_SIGNER_KEY";

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML failed to parse or validate.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or contains unknown fields.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads the signing key seed from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnv`] if the variable is unset or empty.
    pub fn signer_seed_from_env() -> Result<String, ConfigError> {
        match std::env::var(SIGNER_KEY_ENV) {
            Ok(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ConfigError::MissingEnv(SIGNER_KEY_ENV)),
        }
    }
}

/// Scheduler, store, and HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Bind address for the operator HTTP surface.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Seconds between poll cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Maximum concurrently running analyses.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum analysis attempts before a build is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl DaemonConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// On-chain registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    /// Ethereum JSON-RPC endpoint.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Address of the app controller registry contract.
    #[serde(default = "default_app_controller")]
    pub app_controller: String,

    /// Block the registry contract was deployed at; the first scan for any
    /// app starts here.
    #[serde(default = "default_start_block")]
    pub start_block: u64,

    /// Extra blocks scanned past the latest release pointer.
    #[serde(default = "default_block_buffer")]
    pub block_buffer: u64,
}

/// Build-info resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    /// Base URL of the build-info lookup service.
    #[serde(default = "default_resolver_base")]
    pub base_url: String,

    /// Fixed delay between consecutive resolver calls, in milliseconds.
    /// Respects upstream rate limits.
    #[serde(default = "default_call_delay_ms")]
    pub call_delay_ms: u64,

    /// Retry attempts for rate-limited responses.
    #[serde(default = "default_resolver_retries")]
    pub max_retries: u32,
}

impl ResolverConfig {
    /// Inter-call delay as a [`Duration`].
    #[must_use]
    pub const fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }
}

/// Repository fetcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetcherConfig {
    /// Directory ephemeral clone workspaces are created under. Defaults to
    /// the system temp directory.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    /// Clone timeout in seconds.
    #[serde(default = "default_clone_timeout_secs")]
    pub clone_timeout_secs: u64,

    /// Checkout timeout in seconds.
    #[serde(default = "default_checkout_timeout_secs")]
    pub checkout_timeout_secs: u64,

    /// Maximum on-disk repository size in megabytes.
    #[serde(default = "default_max_repo_size_mb")]
    pub max_repo_size_mb: u64,
}

/// External analyzer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzerConfig {
    /// Command invoked for each analysis. Receives the workspace path, the
    /// repository URL, and the resolved commit as trailing arguments and must
    /// print a schema-valid report to stdout.
    #[serde(default = "default_analyzer_command")]
    pub command: String,

    /// Extra arguments placed before the positional ones.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("vcr.db")
}
fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}
const fn default_poll_interval_secs() -> u64 {
    300
}
const fn default_max_concurrent() -> usize {
    3
}
const fn default_max_retries() -> u32 {
    2
}
fn default_rpc_url() -> String {
    "https://eth.llamarpc.com".to_string()
}
fn default_app_controller() -> String {
    "0xc38d35Fc995e75342A21CBd6D770305b142Fbe67".to_string()
}
const fn default_start_block() -> u64 {
    23_443_466
}
const fn default_block_buffer() -> u64 {
    10
}
fn default_resolver_base() -> String {
    "https://userapi-compute.eigencloud.xyz".to_string()
}
const fn default_call_delay_ms() -> u64 {
    1500
}
const fn default_resolver_retries() -> u32 {
    3
}
const fn default_clone_timeout_secs() -> u64 {
    120
}
const fn default_checkout_timeout_secs() -> u64 {
    30
}
const fn default_max_repo_size_mb() -> u64 {
    500
}
fn default_analyzer_command() -> String {
    "vcr-analyze".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bind_addr: default_bind_addr(),
            poll_interval_secs: default_poll_interval_secs(),
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            app_controller: default_app_controller(),
            start_block: default_start_block(),
            block_buffer: default_block_buffer(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: default_resolver_base(),
            call_delay_ms: default_call_delay_ms(),
            max_retries: default_resolver_retries(),
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            clone_timeout_secs: default_clone_timeout_secs(),
            checkout_timeout_secs: default_checkout_timeout_secs(),
            max_repo_size_mb: default_max_repo_size_mb(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            command: default_analyzer_command(),
            args: Vec::new(),
        }
    }
}
