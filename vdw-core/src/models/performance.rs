use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceLog {
    pub log_id: String,
    pub tool_id: String,
    pub project_id: Option<Uuid>,
    pub execution_start: DateTime<Utc>,
    pub execution_end: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    pub error_message: Option<String>,
    pub input_size_bytes: Option<i64>,
    pub output_size_bytes: Option<i64>,
    pub memory_usage_mb: Option<f64>,
    pub cpu_usage_percent: Option<f64>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordUsageInput {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub success: bool,
    pub duration_ms: f64,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub input_size_bytes: Option<i64>,
    #[serde(default)]
    pub output_size_bytes: Option<i64>,
    #[serde(default)]
    pub memory_usage_mb: Option<f64>,
    #[serde(default)]
    pub cpu_usage_percent: Option<f64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl RecordUsageInput {
    pub fn outcome(success: bool, duration_ms: f64) -> Self {
        Self {
            success,
            duration_ms,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsFilter {
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default = "default_window_days")]
    pub days: u32,
}

fn default_window_days() -> u32 {
    30
}

impl Default for AnalyticsFilter {
    fn default() -> Self {
        Self {
            tool_id: None,
            project_id: None,
            days: default_window_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceAnalytics {
    pub total_executions: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub slowest_tools: Vec<ToolStat>,
    pub most_used_tools: Vec<ToolStat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolStat {
    pub tool_id: String,
    pub name: String,
    pub executions: u64,
    pub average_duration_ms: f64,
}
