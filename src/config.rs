use std::time::Duration;

use vdw_core::models::Severity;
use vdw_core::registry::RegistryPolicy;

pub const DEFAULT_MAX_REJECTIONS: u32 = 5;
pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Runtime knobs for the orchestrator and the state machines it drives.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Rejections allowed per phase before the project is forced to FAILED.
    pub max_rejections_per_phase: u32,
    /// How long a project may wait for a human decision. `None` waits forever.
    pub validation_timeout: Option<Duration>,
    /// Upper bound on a single oracle query.
    pub oracle_timeout: Duration,
    pub registry_policy: RegistryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_rejections_per_phase: DEFAULT_MAX_REJECTIONS,
            validation_timeout: None,
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
            registry_policy: RegistryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_vulnerability_threshold(mut self, threshold: Severity) -> Self {
        self.registry_policy.vulnerability_threshold = threshold;
        self
    }
}

/// Parses a severity name for CLI and environment input.
pub fn parse_severity(raw: &str) -> Result<Severity, String> {
    Severity::from_str(&raw.to_ascii_lowercase())
        .ok_or_else(|| format!("unknown severity '{raw}', expected low, medium, high or critical"))
}
