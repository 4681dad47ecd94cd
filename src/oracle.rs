//! The reasoning oracle: an optional external advisor asked whether a phase
//! transition should go ahead.
//!
//! The state machine never waits on it for longer than its configured bound.
//! A timeout or transport failure surfaces as
//! [`VdwError::OracleUnavailable`], which callers treat as "no opinion" and
//! fall back to the local adjacency check.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::error::VdwError;
use crate::metrics::VdwMetrics;
use crate::models::{PhaseState, ProjectContext, Stage};

pub const TRANSITION_QUERY: &str = "transition_validation";

/// What the oracle gets to see of a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectSnapshot {
    pub project_id: Uuid,
    pub initial_vibe: String,
    /// Stages that already have an output.
    pub completed_outputs: Vec<Stage>,
    pub user_feedback: BTreeMap<Stage, String>,
    pub rejection_counts: BTreeMap<Stage, u32>,
    pub required_capabilities: Vec<String>,
    pub tools_created: Vec<String>,
}

impl From<&ProjectContext> for ProjectSnapshot {
    fn from(ctx: &ProjectContext) -> Self {
        Self {
            project_id: ctx.project_id,
            initial_vibe: ctx.initial_vibe.clone(),
            completed_outputs: ctx.phase_outputs.keys().copied().collect(),
            user_feedback: ctx.user_feedback.clone(),
            rejection_counts: ctx.rejection_counts.clone(),
            required_capabilities: ctx.required_capabilities.clone(),
            tools_created: ctx.tools_created.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OracleRequest {
    pub query_type: String,
    pub from_phase: PhaseState,
    pub to_phase: PhaseState,
    pub snapshot: ProjectSnapshot,
}

impl OracleRequest {
    pub fn transition(from: PhaseState, to: PhaseState, ctx: &ProjectContext) -> Self {
        Self {
            query_type: TRANSITION_QUERY.to_string(),
            from_phase: from,
            to_phase: to,
            snapshot: ProjectSnapshot::from(ctx),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OracleVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl OracleVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("oracle answered with status {0}")]
    Status(u16),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn query(&self, request: &OracleRequest) -> Result<OracleVerdict, OracleError>;
}

/// Oracle reached over HTTP: the request is POSTed as JSON and the body of a
/// 2xx answer is read as an [`OracleVerdict`].
pub struct HttpOracle {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpOracle {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ReasoningOracle for HttpOracle {
    async fn query(&self, request: &OracleRequest) -> Result<OracleVerdict, OracleError> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Status(status.as_u16()));
        }
        Ok(response.json::<OracleVerdict>().await?)
    }
}

/// Asks `oracle` about `request`, giving up after `timeout`. The wait is
/// recorded in `metrics` whatever the outcome.
pub async fn consult(
    oracle: &dyn ReasoningOracle,
    request: &OracleRequest,
    timeout: Duration,
    metrics: Option<&VdwMetrics>,
) -> Result<OracleVerdict, VdwError> {
    let started = Instant::now();
    let answer = tokio::time::timeout(timeout, oracle.query(request)).await;
    if let Some(metrics) = metrics {
        metrics.observe_oracle_latency(started.elapsed().as_secs_f64() * 1000.0);
    }

    match answer {
        Ok(Ok(verdict)) => {
            debug!(
                from = %request.from_phase,
                to = %request.to_phase,
                allowed = verdict.allowed,
                "oracle verdict"
            );
            Ok(verdict)
        }
        Ok(Err(err)) => Err(VdwError::OracleUnavailable(err.to_string())),
        Err(_) => Err(VdwError::OracleUnavailable(format!(
            "no answer within {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::models::CreateProjectInput;

    struct Slow;

    #[async_trait]
    impl ReasoningOracle for Slow {
        async fn query(&self, _request: &OracleRequest) -> Result<OracleVerdict, OracleError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(OracleVerdict::allow())
        }
    }

    struct Broken;

    #[async_trait]
    impl ReasoningOracle for Broken {
        async fn query(&self, _request: &OracleRequest) -> Result<OracleVerdict, OracleError> {
            Err(OracleError::Other("connection refused".into()))
        }
    }

    fn request() -> OracleRequest {
        let ctx = ProjectContext::new(CreateProjectInput::from_vibe("todo app"));
        OracleRequest::transition(PhaseState::Idle, PhaseState::Work(Stage::Mood), &ctx)
    }

    #[tokio::test]
    async fn slow_oracle_times_out() {
        let result = consult(&Slow, &request(), Duration::from_millis(20), None).await;
        assert!(matches!(result, Err(VdwError::OracleUnavailable(_))));
    }

    #[tokio::test]
    async fn broken_oracle_is_unavailable() {
        let result = consult(&Broken, &request(), Duration::from_secs(1), None).await;
        assert!(matches!(result, Err(VdwError::OracleUnavailable(msg)) if msg.contains("refused")));
    }

    #[tokio::test]
    async fn every_query_is_timed() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.metrics();
        consult(&Broken, &request(), Duration::from_secs(1), Some(metrics))
            .await
            .unwrap_err();
        consult(&Slow, &request(), Duration::from_millis(20), Some(metrics))
            .await
            .unwrap_err();
        assert_eq!(metrics.oracle_query_count(), 2);
    }

    #[test]
    fn request_carries_transition_and_snapshot() {
        let json = serde_json::to_value(request()).unwrap();
        assert_eq!(json["query_type"], TRANSITION_QUERY);
        assert_eq!(json["from_phase"], "IDLE");
        assert_eq!(json["to_phase"], "PHASE_1_WORK");
        assert_eq!(json["snapshot"]["initial_vibe"], "todo app");
    }

    #[test]
    fn verdict_reason_is_optional() {
        let verdict: OracleVerdict = serde_json::from_str(r#"{"allowed": true}"#).unwrap();
        assert_eq!(verdict, OracleVerdict::allow());
    }
}
