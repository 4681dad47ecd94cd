use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub capability_id: String,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCapabilityInput {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
}

impl CreateCapabilityInput {
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: format!("Provides {name}"),
            name,
            category: None,
        }
    }
}

/// Weighted edge between a tool and one capability it offers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCapability {
    pub tool_id: String,
    pub capability_id: String,
    pub capability_name: String,
    pub strength: f64,
    pub confidence: f64,
}
