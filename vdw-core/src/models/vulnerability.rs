use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vulnerability {
    pub vulnerability_id: String,
    pub tool_id: String,
    pub severity: Severity,
    pub description: String,
    pub cve_id: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub patched_at: Option<DateTime<Utc>>,
    pub patched_in_version: Option<String>,
}

impl Vulnerability {
    pub fn is_open(&self) -> bool {
        self.patched_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportVulnerabilityInput {
    pub tool_id: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub cve_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchVulnerabilityInput {
    pub vulnerability_id: String,
    #[serde(default)]
    pub patched_in_version: Option<String>,
}
