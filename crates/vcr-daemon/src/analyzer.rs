//! External analyzer boundary.
//!
//! The analysis itself is an external collaborator: a configured command
//! receives a workspace path, the repository URL, and the resolved commit,
//! and prints a report to stdout. Analyzer output is treated as untrusted
//! free text; [`extract_report`] is the single parsing boundary that turns
//! it into a schema-valid [`Report`] or a tagged error. Preference order:
//! the whole output as JSON, then a fenced ```json block, then the outermost
//! brace-delimited slice.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use vcr_core::config::AnalyzerConfig;
use vcr_core::report::Report;

/// Errors produced by the analyzer boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AnalyzerError {
    /// The analyzer process could not be spawned.
    #[error("failed to spawn analyzer: {0}")]
    Spawn(std::io::Error),

    /// The analyzer exited non-zero.
    #[error("analyzer exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    /// No parseable report was found in the analyzer output.
    #[error("no report found in analyzer output")]
    NoReport,

    /// A JSON candidate was found but does not match the report schema.
    #[error("analyzer output does not match report schema: {0}")]
    SchemaMismatch(String),
}

/// The result of one analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub report: Report,
    /// Accumulated analysis logs, attested alongside the report.
    pub logs: Value,
}

/// Seam for mocking analysis in scheduler tests.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyzes a checked-out workspace.
    async fn analyze(
        &self,
        workspace: &Path,
        repo_url: &str,
        commit: &str,
    ) -> Result<AnalysisOutcome, AnalyzerError>;
}

/// Production analyzer invoking a configured external command.
pub struct CommandAnalyzer {
    config: AnalyzerConfig,
}

impl CommandAnalyzer {
    /// Creates an analyzer from configuration.
    #[must_use]
    pub const fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn analyze(
        &self,
        workspace: &Path,
        repo_url: &str,
        commit: &str,
    ) -> Result<AnalysisOutcome, AnalyzerError> {
        debug!(command = %self.config.command, repo_url, commit, "invoking analyzer");
        let output = tokio::process::Command::new(&self.config.command)
            .args(&self.config.args)
            .arg(workspace)
            .arg(repo_url)
            .arg(commit)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(AnalyzerError::Spawn)?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(AnalyzerError::Failed {
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let report = extract_report(&stdout)?;
        // stderr doubles as the analysis log stream.
        let logs = Value::Array(
            stderr
                .lines()
                .filter(|line| !line.is_empty())
                .map(|line| Value::String(line.to_string()))
                .collect(),
        );
        Ok(AnalysisOutcome { report, logs })
    }
}

/// Extracts a schema-valid report from free-form analyzer output.
///
/// # Errors
///
/// Returns [`AnalyzerError::NoReport`] when no JSON candidate exists, or
/// [`AnalyzerError::SchemaMismatch`] when a candidate parses as JSON but not
/// as a [`Report`].
pub fn extract_report(output: &str) -> Result<Report, AnalyzerError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(AnalyzerError::NoReport);
    }

    // Strict path first: the contract says stdout is the report.
    if let Ok(report) = serde_json::from_str::<Report>(trimmed) {
        return Ok(report);
    }

    // Wrapped output fallbacks. Track the schema error from the most
    // promising candidate so the operator sees why it was rejected.
    let mut schema_error: Option<String> = None;
    for candidate in [fenced_json_block(trimmed), outer_brace_slice(trimmed)]
        .into_iter()
        .flatten()
    {
        match serde_json::from_str::<Report>(candidate) {
            Ok(report) => return Ok(report),
            Err(err) => {
                // Only a candidate that is at least valid JSON counts as a
                // schema mismatch.
                if serde_json::from_str::<Value>(candidate).is_ok() {
                    schema_error.get_or_insert(err.to_string());
                }
            }
        }
    }

    match schema_error {
        Some(err) => Err(AnalyzerError::SchemaMismatch(err)),
        None => Err(AnalyzerError::NoReport),
    }
}

/// Finds the contents of the first ```json fenced block.
fn fenced_json_block(text: &str) -> Option<&str> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// Slices from the first `{` to the last `}`.
fn outer_brace_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
