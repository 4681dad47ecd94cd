use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dependency::DependencyKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    pub tool_id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    /// Where the tool's server can be reached.
    pub location: Option<String>,
    pub input_schema: Option<serde_json::Value>,
    pub output_schema: Option<serde_json::Value>,
    /// Project that synthesized the tool.
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub success_rate: f64,
    /// Mean invocation duration in milliseconds.
    pub average_duration: f64,
    pub deprecated: bool,
    pub deprecation_reason: Option<String>,
    pub replacement_tool_id: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateToolInput {
    /// Caller-chosen id; a UUID is generated when absent.
    #[serde(default)]
    pub tool_id: Option<String>,
    pub name: String,
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    pub created_by: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl CreateToolInput {
    pub fn new(tool_id: impl Into<String>, name: impl Into<String>, created_by: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            tool_id: Some(tool_id.into()),
            description: format!("{name} tool"),
            name,
            version: default_version(),
            location: None,
            input_schema: None,
            output_schema: None,
            created_by: created_by.into(),
            metadata: None,
        }
    }
}

/// A capability the new tool offers, referenced by capability name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityEdgeInput {
    pub capability: String,
    #[serde(default = "full_weight")]
    pub strength: f64,
    #[serde(default = "full_weight")]
    pub confidence: f64,
}

fn full_weight() -> f64 {
    1.0
}

impl CapabilityEdgeInput {
    pub fn new(capability: impl Into<String>, strength: f64, confidence: f64) -> Self {
        Self {
            capability: capability.into(),
            strength,
            confidence,
        }
    }
}

/// An outgoing dependency edge of the tool being registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdgeInput {
    pub tool_id: String,
    #[serde(default = "default_kind")]
    pub kind: DependencyKind,
}

fn default_kind() -> DependencyKind {
    DependencyKind::Requires
}

impl DependencyEdgeInput {
    pub fn requires(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            kind: DependencyKind::Requires,
        }
    }

    pub fn conflicts(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            kind: DependencyKind::Conflicts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeprecateToolInput {
    pub reason: String,
    #[serde(default)]
    pub replacement_tool_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolFilter {
    #[serde(default)]
    pub include_deprecated: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}
