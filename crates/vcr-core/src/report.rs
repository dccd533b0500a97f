//! Structured trust-analysis report schema.
//!
//! This is the contract with the external analyzer: whatever produces the
//! analysis must emit a document that deserializes into [`Report`]. The wire
//! format is camelCase JSON; field names are stable because the content hash
//! in the attestation is computed over the serialized report.

use serde::{Deserialize, Serialize};

/// Current report schema version.
pub const REPORT_VERSION: &str = "2.0.0";

/// Overall trust label assigned by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLabel {
    #[serde(rename = "SAFE TO USE")]
    SafeToUse,
    #[serde(rename = "GENERALLY SAFE")]
    GenerallySafe,
    #[serde(rename = "USE WITH CAUTION")]
    UseWithCaution,
    #[serde(rename = "UNSAFE")]
    Unsafe,
}

/// Kind of codebase the analyzer decided it was looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeType {
    Solidity,
    Backend,
    Mixed,
    Unknown,
}

/// A concrete piece of evidence backing a trust assumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Path of the file the evidence was found in.
    pub file: String,
    /// Line range, e.g. `"10-24"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<String>,
    /// Code snippet quoted from the file.
    pub snippet: String,
}

/// One itemized thing a user of the application is implicitly trusting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustAssumption {
    pub id: String,
    pub title: String,
    pub description: String,
    pub what_you_are_trusting: String,
    pub evidence: Vec<Evidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mitigations: Option<String>,
}

/// Per-category findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryReport {
    pub summary: String,
    pub trust_assumptions: Vec<TrustAssumption>,
}

/// The fixed set of analysis categories. Absent categories were not
/// applicable to the analyzed codebase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Categories {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_privileges: Option<CategoryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_mechanisms: Option<CategoryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_access: Option<CategoryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fund_control: Option<CategoryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_switches: Option<CategoryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backdoors: Option<CategoryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disclosure_level: Option<CategoryReport>,
}

/// The complete analysis report for one source revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Schema version; currently always [`REPORT_VERSION`].
    pub version: String,
    /// RFC 3339 timestamp of report generation.
    pub generated_at: String,
    pub repo_url: String,
    /// The resolved commit the analysis ran against.
    pub repo_commit: String,
    pub code_type: CodeType,
    pub trust_label: TrustLabel,
    pub trust_label_reason: String,
    pub executive_summary: String,
    pub categories: Categories,
    /// Human-readable rendering of the findings.
    pub markdown_summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> Report {
        Report {
            version: REPORT_VERSION.to_string(),
            generated_at: "2026-01-15T12:00:00Z".to_string(),
            repo_url: "https://github.com/x/y".to_string(),
            repo_commit: "0123456789abcdef0123456789abcdef01234567".to_string(),
            code_type: CodeType::Backend,
            trust_label: TrustLabel::UseWithCaution,
            trust_label_reason: "admin key can rotate the signer".to_string(),
            executive_summary: "summary".to_string(),
            categories: Categories {
                admin_privileges: Some(CategoryReport {
                    summary: "one admin key".to_string(),
                    trust_assumptions: vec![TrustAssumption {
                        id: "AP-1".to_string(),
                        title: "Owner can pause".to_string(),
                        description: "pause() is owner-gated".to_string(),
                        what_you_are_trusting: "the owner key holder".to_string(),
                        evidence: vec![Evidence {
                            file: "src/app.sol".to_string(),
                            lines: Some("10-24".to_string()),
                            snippet: "function pause() onlyOwner".to_string(),
                        }],
                        mitigations: None,
                    }],
                }),
                ..Categories::default()
            },
            markdown_summary: "# Report".to_string(),
        }
    }

    #[test]
    fn wire_format_is_camel_case() {
        let json = serde_json::to_value(sample_report()).unwrap();
        assert_eq!(json["version"], REPORT_VERSION);
        assert!(json.get("generatedAt").is_some());
        assert!(json.get("trustLabel").is_some());
        assert_eq!(json["trustLabel"], "USE WITH CAUTION");
        assert!(json["categories"].get("adminPrivileges").is_some());
        // Skipped optionals must not appear at all.
        assert!(json["categories"].get("fundControl").is_none());
        let assumption = &json["categories"]["adminPrivileges"]["trustAssumptions"][0];
        assert!(assumption.get("whatYouAreTrusting").is_some());
    }

    #[test]
    fn round_trips_through_json() {
        let report = sample_report();
        let json = serde_json::to_string(&report).unwrap();
        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn rejects_unknown_trust_label() {
        let mut json = serde_json::to_value(sample_report()).unwrap();
        json["trustLabel"] = "PROBABLY FINE".into();
        assert!(serde_json::from_value::<Report>(json).is_err());
    }
}
