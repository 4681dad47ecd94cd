use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::{PhaseState, Stage};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectContext {
    pub project_id: Uuid,
    pub current_phase: PhaseState,
    pub initial_vibe: String,
    /// Capability names the project's agents will need; checked on every dispatch.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Output blob of each work phase that has completed at least once.
    #[serde(default)]
    pub phase_outputs: BTreeMap<Stage, serde_json::Value>,
    /// Latest feedback per phase. Rejecting one phase never touches another's entry.
    #[serde(default)]
    pub user_feedback: BTreeMap<Stage, String>,
    #[serde(default)]
    pub rejection_counts: BTreeMap<Stage, u32>,
    #[serde(default)]
    pub tools_created: Vec<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When `current_phase` was last entered.
    pub phase_entered_at: DateTime<Utc>,
}

impl ProjectContext {
    pub fn new(input: CreateProjectInput) -> Self {
        let now = Utc::now();
        Self {
            project_id: Uuid::new_v4(),
            current_phase: PhaseState::Idle,
            initial_vibe: input.vibe,
            required_capabilities: input.required_capabilities,
            phase_outputs: BTreeMap::new(),
            user_feedback: BTreeMap::new(),
            rejection_counts: BTreeMap::new(),
            tools_created: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
            phase_entered_at: now,
        }
    }

    pub fn set_phase_output(&mut self, stage: Stage, output: serde_json::Value) {
        self.phase_outputs.insert(stage, output);
        self.updated_at = Utc::now();
    }

    pub fn phase_output(&self, stage: Stage) -> Option<&serde_json::Value> {
        self.phase_outputs.get(&stage)
    }

    pub fn enter(&mut self, state: PhaseState) {
        let now = Utc::now();
        self.current_phase = state;
        self.updated_at = now;
        self.phase_entered_at = now;
    }

    pub fn record_tool(&mut self, tool_id: &str) {
        if !self.tools_created.iter().any(|id| id == tool_id) {
            self.tools_created.push(tool_id.to_string());
            self.updated_at = Utc::now();
        }
    }

    pub fn artifacts(&self) -> ProjectArtifacts {
        ProjectArtifacts {
            project_id: self.project_id,
            current_phase: self.current_phase,
            outputs: self.phase_outputs.clone(),
            tools_created: self.tools_created.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectInput {
    pub vibe: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl CreateProjectInput {
    pub fn from_vibe(vibe: impl Into<String>) -> Self {
        Self {
            vibe: vibe.into(),
            required_capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectArtifacts {
    pub project_id: Uuid,
    pub current_phase: PhaseState,
    pub outputs: BTreeMap<Stage, serde_json::Value>,
    pub tools_created: Vec<String>,
}
