//! Per-project phase controller.
//!
//! A [`PhaseStateMachine`] owns one [`ProjectContext`] and is the only thing
//! allowed to move its `current_phase`. Every move is checked against the
//! fixed graph in [`PhaseState::next`], then offered to the reasoning oracle
//! when one is configured, and only then applied and announced on the bus.
//! A refused move leaves the context exactly as it was.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{Result, VdwError};
use crate::event_bus::{EventBus, VdwEvent};
use crate::metrics::VdwMetrics;
use crate::models::{PhaseEvent, PhaseState, ProjectContext, Stage};
use crate::oracle::{self, OracleRequest, ReasoningOracle};
use crate::registry::ToolRegistry;

pub struct PhaseStateMachine {
    ctx: ProjectContext,
    bus: EventBus,
    registry: ToolRegistry,
    oracle: Option<Arc<dyn ReasoningOracle>>,
    config: OrchestratorConfig,
    metrics: Option<VdwMetrics>,
}

impl PhaseStateMachine {
    pub fn new(
        ctx: ProjectContext,
        bus: EventBus,
        registry: ToolRegistry,
        oracle: Option<Arc<dyn ReasoningOracle>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ctx,
            bus,
            registry,
            oracle,
            config,
            metrics: None,
        }
    }

    /// Records phase durations and oracle latency into `metrics`.
    pub fn with_metrics(mut self, metrics: VdwMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn context(&self) -> &ProjectContext {
        &self.ctx
    }

    pub fn current(&self) -> PhaseState {
        self.ctx.current_phase
    }

    /// Moves to `target` if it is one step away in the graph and the oracle
    /// (if any) does not object.
    pub async fn transition_to(&mut self, target: PhaseState, reason: &str) -> Result<PhaseState> {
        self.check(target).await?;
        self.apply(target, reason);
        Ok(target)
    }

    /// IDLE -> phase 1 work, then dispatches the first agent.
    pub async fn start(&mut self) -> Result<PhaseState> {
        let target = PhaseState::Work(Stage::Mood);
        self.transition_to(target, "project_created").await?;
        self.dispatch(Stage::Mood);
        Ok(target)
    }

    /// Stores the agent's output for `stage` and hands the project to a human.
    pub async fn complete_work(&mut self, stage: Stage, output: serde_json::Value) -> Result<PhaseState> {
        self.expect_state(PhaseState::Work(stage), "complete work for")?;
        let target = PhaseState::Validation(stage);
        self.check(target).await?;

        self.ctx.set_phase_output(stage, output);
        self.apply(target, &format!("{} completed", stage.as_str()));
        Ok(target)
    }

    pub async fn approve(&mut self, stage: Stage, feedback: Option<String>) -> Result<PhaseState> {
        let target = self.validation_target(stage, PhaseEvent::Approved, "approve")?;
        self.check(target).await?;

        if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
            self.ctx.user_feedback.insert(stage, feedback);
        }
        self.apply(target, &format!("{} approved", stage.as_str()));
        if let PhaseState::Work(next) = target {
            self.dispatch(next);
        }
        Ok(target)
    }

    /// Sends `stage` back for rework with `feedback`. Only that stage's
    /// feedback entry is replaced. Going over the rejection cap fails the
    /// project instead.
    pub async fn reject(&mut self, stage: Stage, feedback: &str) -> Result<PhaseState> {
        if feedback.trim().is_empty() {
            return Err(VdwError::Validation("rejection feedback must not be empty".into()));
        }
        let target = self.validation_target(stage, PhaseEvent::Rejected, "reject")?;

        let rejections = self.ctx.rejection_counts.get(&stage).copied().unwrap_or(0) + 1;
        if rejections > self.config.max_rejections_per_phase {
            self.ctx.user_feedback.insert(stage, feedback.to_string());
            self.ctx.rejection_counts.insert(stage, rejections);
            warn!(
                project_id = %self.ctx.project_id,
                stage = stage.as_str(),
                rejections,
                "rejection limit reached"
            );
            return self.force_fail(&format!("rejection limit reached for {}", stage.as_str()));
        }

        self.check(target).await?;
        self.ctx.user_feedback.insert(stage, feedback.to_string());
        self.ctx.rejection_counts.insert(stage, rejections);
        self.apply(target, &format!("{} rejected", stage.as_str()));
        self.dispatch(stage);
        Ok(target)
    }

    /// Operator override. Skips the oracle, cancels in-flight agent work and
    /// is a no-op on a project that already failed.
    pub fn force_fail(&mut self, reason: &str) -> Result<PhaseState> {
        if self.ctx.current_phase == PhaseState::Failed {
            return Ok(PhaseState::Failed);
        }
        let target = self
            .ctx
            .current_phase
            .next(PhaseEvent::Abort)
            .unwrap_or(PhaseState::Failed);

        self.ctx.failure_reason = Some(reason.to_string());
        self.apply(target, reason);
        self.bus.publish(VdwEvent::AgentCancel {
            project_id: self.ctx.project_id,
            reason: reason.to_string(),
        });
        Ok(target)
    }

    /// Records a synthesized tool against this project.
    pub fn attach_tool(&mut self, tool_id: &str) -> Result<()> {
        self.registry.require_tool(tool_id)?;
        self.ctx.record_tool(tool_id);
        debug!(project_id = %self.ctx.project_id, tool_id, "attached tool");
        Ok(())
    }

    fn expect_state(&self, expected: PhaseState, action: &str) -> Result<()> {
        if self.ctx.current_phase == expected {
            Ok(())
        } else {
            Err(VdwError::Validation(format!(
                "cannot {action} {} while project is in {}",
                expected
                    .stage()
                    .map_or_else(|| expected.to_string(), |s| s.to_string()),
                self.ctx.current_phase
            )))
        }
    }

    fn validation_target(&self, stage: Stage, event: PhaseEvent, action: &str) -> Result<PhaseState> {
        self.expect_state(PhaseState::Validation(stage), action)?;
        PhaseState::Validation(stage)
            .next(event)
            .ok_or_else(|| VdwError::Validation(format!("no {action} edge from {}", self.ctx.current_phase)))
    }

    /// Adjacency first, then the oracle. Never mutates.
    async fn check(&self, target: PhaseState) -> Result<()> {
        let current = self.ctx.current_phase;
        if !current.can_transition_to(target) {
            return Err(VdwError::Validation(format!(
                "illegal transition {current} -> {target}"
            )));
        }

        let Some(oracle) = &self.oracle else {
            return Ok(());
        };
        let request = OracleRequest::transition(current, target, &self.ctx);
        match oracle::consult(
            oracle.as_ref(),
            &request,
            self.config.oracle_timeout,
            self.metrics.as_ref(),
        )
        .await {
            Ok(verdict) if verdict.allowed => Ok(()),
            Ok(verdict) => {
                let reason = verdict
                    .reason
                    .unwrap_or_else(|| "no reason given".to_string());
                info!(
                    project_id = %self.ctx.project_id,
                    from = %current,
                    to = %target,
                    %reason,
                    "oracle vetoed transition"
                );
                Err(VdwError::Validation(format!(
                    "transition {current} -> {target} vetoed: {reason}"
                )))
            }
            Err(err) => {
                warn!(
                    project_id = %self.ctx.project_id,
                    error = %err,
                    "oracle unavailable, falling back to adjacency check"
                );
                Ok(())
            }
        }
    }

    fn apply(&mut self, target: PhaseState, reason: &str) {
        let from = self.ctx.current_phase;
        if let Some(metrics) = self.metrics.as_ref().filter(|_| from != PhaseState::Idle) {
            let spent = Utc::now() - self.ctx.phase_entered_at;
            metrics.observe_phase_duration(&from.as_string(), spent.num_milliseconds().max(0) as f64);
        }
        self.ctx.enter(target);
        info!(
            project_id = %self.ctx.project_id,
            %from,
            to = %target,
            reason,
            "phase transition"
        );
        self.bus.publish(VdwEvent::PhaseTransition {
            project_id: self.ctx.project_id,
            from,
            to: target,
            reason: reason.to_string(),
        });
    }

    /// Publishes the work order for `stage`, with a gap report when the
    /// project declared required capabilities.
    fn dispatch(&self, stage: Stage) {
        let mut missing = Vec::new();
        if !self.ctx.required_capabilities.is_empty() {
            match self.registry.gap_analysis(&self.ctx.required_capabilities) {
                Ok(report) => {
                    if !report.missing.is_empty() || !report.weak.is_empty() {
                        self.bus.publish(VdwEvent::CapabilityGap {
                            project_id: self.ctx.project_id,
                            stage,
                            missing: report.missing.clone(),
                            weak: report.weak,
                        });
                    }
                    missing = report.missing;
                }
                Err(err) => warn!(
                    project_id = %self.ctx.project_id,
                    error = %err,
                    "gap analysis failed, dispatching without it"
                ),
            }
        }

        self.bus.publish(VdwEvent::AgentDispatch {
            project_id: self.ctx.project_id,
            stage,
            initial_vibe: self.ctx.initial_vibe.clone(),
            feedback: self.ctx.user_feedback.clone(),
            previous_outputs: self.ctx.phase_outputs.clone(),
            missing_capabilities: missing,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::db::Database;
    use crate::event_bus::{topics, Subscription};
    use crate::metrics::MetricsRegistry;
    use crate::models::{CapabilityEdgeInput, CreateCapabilityInput, CreateProjectInput, CreateToolInput};
    use crate::oracle::{OracleError, OracleVerdict};

    /// Answers from a fixed script and remembers what it was asked.
    struct Scripted {
        allow: bool,
        asked: Mutex<Vec<(PhaseState, PhaseState)>>,
    }

    impl Scripted {
        fn new(allow: bool) -> Arc<Self> {
            Arc::new(Self {
                allow,
                asked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ReasoningOracle for Scripted {
        async fn query(&self, request: &OracleRequest) -> std::result::Result<OracleVerdict, OracleError> {
            self.asked
                .lock()
                .unwrap()
                .push((request.from_phase, request.to_phase));
            Ok(if self.allow {
                OracleVerdict::allow()
            } else {
                OracleVerdict::deny("artifacts incomplete")
            })
        }
    }

    struct Down;

    #[async_trait]
    impl ReasoningOracle for Down {
        async fn query(&self, _request: &OracleRequest) -> std::result::Result<OracleVerdict, OracleError> {
            Err(OracleError::Other("unreachable".into()))
        }
    }

    fn registry() -> ToolRegistry {
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        ToolRegistry::new(db)
    }

    fn machine_at(
        state: PhaseState,
        oracle: Option<Arc<dyn ReasoningOracle>>,
    ) -> (PhaseStateMachine, Subscription) {
        let bus = EventBus::new();
        let sub = bus.subscribe_all();
        let mut ctx = ProjectContext::new(CreateProjectInput::from_vibe("build a chat app"));
        ctx.current_phase = state;
        let machine = PhaseStateMachine::new(ctx, bus, registry(), oracle, OrchestratorConfig::default());
        (machine, sub)
    }

    #[tokio::test]
    async fn adjacency_and_oracle_matrix() {
        for from in PhaseState::ALL {
            for to in PhaseState::ALL {
                let adjacent = from.can_transition_to(to);
                for allow in [true, false] {
                    let scripted = Scripted::new(allow);
                    let (mut machine, mut sub) =
                        machine_at(from, Some(scripted.clone() as Arc<dyn ReasoningOracle>));
                    let before = machine.context().clone();

                    let result = machine.transition_to(to, "matrix").await;

                    if adjacent && allow {
                        assert_eq!(result.unwrap(), to, "{from} -> {to}");
                        assert_eq!(machine.current(), to);
                        let events = sub.drain();
                        assert_eq!(events.len(), 1);
                        assert_eq!(events[0].topic, topics::PHASE_TRANSITION);
                    } else {
                        assert!(matches!(result, Err(VdwError::Validation(_))), "{from} -> {to}");
                        assert_eq!(machine.context(), &before);
                        assert!(sub.drain().is_empty());
                    }

                    let asked = scripted.asked.lock().unwrap().len();
                    assert_eq!(asked, usize::from(adjacent), "oracle consulted for {from} -> {to}");
                }
            }
        }
    }

    #[tokio::test]
    async fn leaving_a_phase_records_its_duration() {
        let registry = MetricsRegistry::new().unwrap();
        let (machine, _sub) = machine_at(PhaseState::Idle, Some(Scripted::new(true) as Arc<dyn ReasoningOracle>));
        let mut machine = machine.with_metrics(registry.metrics().clone());

        machine.start().await.unwrap();
        machine.complete_work(Stage::Mood, serde_json::json!({})).await.unwrap();
        machine.reject(Stage::Mood, "again").await.unwrap();

        let metrics = registry.metrics();
        assert_eq!(metrics.phase_sample_count("IDLE"), 0);
        assert_eq!(metrics.phase_sample_count("PHASE_1_WORK"), 1);
        assert_eq!(metrics.phase_sample_count("PHASE_1_VALIDATION"), 1);
        assert_eq!(metrics.oracle_query_count(), 3);
    }

    #[tokio::test]
    async fn unavailable_oracle_falls_back_to_adjacency() {
        let (mut machine, _sub) = machine_at(PhaseState::Idle, Some(Arc::new(Down) as Arc<dyn ReasoningOracle>));
        assert_eq!(machine.start().await.unwrap(), PhaseState::Work(Stage::Mood));

        let err = machine
            .transition_to(PhaseState::Completed, "skip")
            .await
            .unwrap_err();
        assert!(matches!(err, VdwError::Validation(_)));
    }

    #[tokio::test]
    async fn veto_reason_reaches_the_caller() {
        let (mut machine, _sub) = machine_at(
            PhaseState::Work(Stage::Architecture),
            Some(Scripted::new(false) as Arc<dyn ReasoningOracle>),
        );
        let err = machine
            .complete_work(Stage::Architecture, serde_json::json!({"diagram": "..."}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("artifacts incomplete"));
        assert!(machine.context().phase_output(Stage::Architecture).is_none());
    }

    #[tokio::test]
    async fn feedback_is_kept_per_phase() {
        let (mut machine, mut sub) = machine_at(PhaseState::Validation(Stage::Mood), None);

        machine.reject(Stage::Mood, "more color").await.unwrap();
        machine.complete_work(Stage::Mood, serde_json::json!({"v": 2})).await.unwrap();
        machine.reject(Stage::Mood, "less color").await.unwrap();
        machine.complete_work(Stage::Mood, serde_json::json!({"v": 3})).await.unwrap();
        machine.approve(Stage::Mood, None).await.unwrap();
        machine
            .complete_work(Stage::Architecture, serde_json::json!({}))
            .await
            .unwrap();
        machine.reject(Stage::Architecture, "use Postgres").await.unwrap();

        let ctx = machine.context();
        assert_eq!(ctx.user_feedback[&Stage::Mood], "less color");
        assert_eq!(ctx.user_feedback[&Stage::Architecture], "use Postgres");
        assert_eq!(ctx.rejection_counts[&Stage::Mood], 2);
        assert_eq!(ctx.current_phase, PhaseState::Work(Stage::Architecture));

        let last_dispatch = sub
            .drain()
            .into_iter()
            .filter_map(|env| match env.event {
                VdwEvent::AgentDispatch { stage, feedback, .. } => Some((stage, feedback)),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_dispatch.0, Stage::Architecture);
        assert_eq!(last_dispatch.1.len(), 2);
    }

    #[tokio::test]
    async fn approve_and_reject_require_matching_validation_state() {
        let (mut machine, _sub) = machine_at(PhaseState::Work(Stage::Mood), None);
        assert!(matches!(
            machine.approve(Stage::Mood, None).await,
            Err(VdwError::Validation(_))
        ));

        let (mut machine, _sub) = machine_at(PhaseState::Validation(Stage::Mood), None);
        assert!(matches!(
            machine.reject(Stage::Architecture, "wrong phase").await,
            Err(VdwError::Validation(_))
        ));
        assert!(matches!(
            machine.reject(Stage::Mood, "   ").await,
            Err(VdwError::Validation(_))
        ));
        assert!(machine.context().user_feedback.is_empty());
    }

    #[tokio::test]
    async fn last_approval_completes_the_project() {
        let (mut machine, mut sub) =
            machine_at(PhaseState::Validation(Stage::ValidationTesting), None);
        assert_eq!(
            machine.approve(Stage::ValidationTesting, None).await.unwrap(),
            PhaseState::Completed
        );
        let dispatches = sub
            .drain()
            .into_iter()
            .filter(|env| env.topic == topics::AGENT_DISPATCH)
            .count();
        assert_eq!(dispatches, 0);
    }

    #[tokio::test]
    async fn exceeding_the_rejection_cap_fails_the_project() {
        let (mut machine, mut sub) = machine_at(PhaseState::Validation(Stage::Mood), None);
        machine.config.max_rejections_per_phase = 1;

        machine.reject(Stage::Mood, "first").await.unwrap();
        machine.complete_work(Stage::Mood, serde_json::json!({})).await.unwrap();
        let state = machine.reject(Stage::Mood, "second").await.unwrap();

        assert_eq!(state, PhaseState::Failed);
        let ctx = machine.context();
        assert_eq!(ctx.user_feedback[&Stage::Mood], "second");
        assert_eq!(
            ctx.failure_reason.as_deref(),
            Some("rejection limit reached for mood")
        );
        assert!(sub.drain().iter().any(|env| env.topic == topics::AGENT_CANCEL));
    }

    #[tokio::test]
    async fn force_fail_works_from_anywhere_once() {
        for state in PhaseState::ALL {
            let (mut machine, mut sub) = machine_at(state, None);
            assert_eq!(machine.force_fail("operator").unwrap(), PhaseState::Failed);
            let published = sub.drain().len();
            if state == PhaseState::Failed {
                assert_eq!(published, 0);
                assert!(machine.context().failure_reason.is_none());
            } else {
                assert_eq!(published, 2);
                assert_eq!(machine.context().failure_reason.as_deref(), Some("operator"));
            }
        }
    }

    #[tokio::test]
    async fn dispatch_reports_missing_capabilities() {
        let bus = EventBus::new();
        let mut gaps = bus.subscribe(&[topics::TOOLS_GAP, topics::AGENT_DISPATCH]);
        let registry = registry();
        registry
            .ensure_capability(CreateCapabilityInput::named("websocket"))
            .unwrap();
        registry
            .ensure_capability(CreateCapabilityInput::named("auth"))
            .unwrap();
        registry
            .register(
                CreateToolInput::new("ws", "WebSocket server", "seed"),
                &[CapabilityEdgeInput::new("websocket", 0.9, 0.9)],
                &[],
            )
            .unwrap();

        let ctx = ProjectContext::new(CreateProjectInput {
            vibe: "realtime chat".into(),
            required_capabilities: vec!["websocket".into(), "auth".into()],
        });
        let mut machine = PhaseStateMachine::new(ctx, bus, registry, None, OrchestratorConfig::default());
        machine.start().await.unwrap();

        let events: Vec<_> = gaps.drain().into_iter().map(|env| env.event).collect();
        assert!(matches!(
            &events[0],
            VdwEvent::CapabilityGap { missing, .. } if missing == &vec!["auth".to_string()]
        ));
        assert!(matches!(
            &events[1],
            VdwEvent::AgentDispatch { stage: Stage::Mood, missing_capabilities, .. }
                if missing_capabilities == &vec!["auth".to_string()]
        ));
    }

    #[tokio::test]
    async fn attach_tool_requires_a_registered_tool() {
        let (mut machine, _sub) = machine_at(PhaseState::Work(Stage::Implementation), None);
        assert!(matches!(
            machine.attach_tool("ghost"),
            Err(VdwError::NotFound { kind: "tool", .. })
        ));
        machine
            .registry
            .register(CreateToolInput::new("gen", "Generated", "p"), &[], &[])
            .unwrap();
        machine.attach_tool("gen").unwrap();
        machine.attach_tool("gen").unwrap();
        assert_eq!(machine.context().tools_created, vec!["gen".to_string()]);
    }
}
