//! Façade over the per-project state machines.
//!
//! Each project gets its own [`PhaseStateMachine`] behind its own async
//! mutex, so commands for one project are strictly serialized while
//! different projects proceed in parallel. The only shared pieces are the
//! registry, the bus and the database handle.
//!
//! Bus events are routed to one worker task per project, so a slow oracle
//! answer for one project never holds up another project's events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::db::Database;
use crate::error::{Result, VdwError};
use crate::event_bus::{topics, EventBus, Subscription, ValidationDecision, VdwEvent};
use crate::metrics::MetricsRegistry;
use crate::models::{CreateProjectInput, PhaseState, ProjectArtifacts, ProjectContext, Stage};
use crate::oracle::ReasoningOracle;
use crate::registry::ToolRegistry;
use crate::state_machine::PhaseStateMachine;

type Machine = Arc<Mutex<PhaseStateMachine>>;

pub struct Orchestrator {
    db: Database,
    registry: ToolRegistry,
    bus: EventBus,
    oracle: Option<Arc<dyn ReasoningOracle>>,
    config: OrchestratorConfig,
    metrics: Option<MetricsRegistry>,
    projects: RwLock<HashMap<Uuid, Machine>>,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        bus: EventBus,
        oracle: Option<Arc<dyn ReasoningOracle>>,
        config: OrchestratorConfig,
    ) -> Self {
        let registry = ToolRegistry::with_policy(db.clone(), config.registry_policy);
        Self {
            db,
            registry,
            bus,
            oracle,
            config,
            metrics: None,
            projects: RwLock::new(HashMap::new()),
        }
    }

    /// Records phase durations, oracle latency and tool outcomes into
    /// `metrics`. Call before [`Orchestrator::restore`] or the first submit.
    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.registry = self.registry.clone().with_metrics(metrics.metrics().clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<&MetricsRegistry> {
        self.metrics.as_ref()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Loads every stored project back into memory. Returns how many were loaded.
    pub async fn restore(&self) -> Result<usize> {
        let stored = self.db.list_projects()?;
        let mut projects = self.projects.write().await;
        for ctx in stored {
            let project_id = ctx.project_id;
            projects.insert(project_id, Arc::new(Mutex::new(self.machine_for(ctx))));
        }
        info!(count = projects.len(), "restored projects");
        Ok(projects.len())
    }

    /// Creates a project from a vibe and starts phase 1.
    pub async fn submit(&self, input: CreateProjectInput) -> Result<Uuid> {
        if input.vibe.trim().is_empty() {
            return Err(VdwError::Validation("vibe must not be empty".into()));
        }

        let machine = Arc::new(Mutex::new(self.machine_for(ProjectContext::new(input))));
        // The project is reachable before its first dispatch goes out; events
        // for it queue on the lock held here.
        let mut guard = Arc::clone(&machine).lock_owned().await;
        let project_id = guard.context().project_id;
        self.projects.write().await.insert(project_id, machine);

        if let Err(err) = guard.start().await {
            drop(guard);
            self.projects.write().await.remove(&project_id);
            return Err(err);
        }
        self.persist(guard.context());
        info!(%project_id, "project submitted");
        Ok(project_id)
    }

    pub async fn agent_completed(
        &self,
        project_id: Uuid,
        stage: Stage,
        output: serde_json::Value,
    ) -> Result<PhaseState> {
        let machine = self.machine(project_id).await?;
        let mut machine = machine.lock().await;
        let state = machine.complete_work(stage, output).await?;
        self.persist(machine.context());
        Ok(state)
    }

    pub async fn approve(&self, project_id: Uuid, stage: Stage, feedback: Option<String>) -> Result<PhaseState> {
        let machine = self.machine(project_id).await?;
        let mut machine = machine.lock().await;
        let state = machine.approve(stage, feedback).await?;
        self.persist(machine.context());
        Ok(state)
    }

    pub async fn reject(&self, project_id: Uuid, stage: Stage, feedback: &str) -> Result<PhaseState> {
        let machine = self.machine(project_id).await?;
        let mut machine = machine.lock().await;
        let state = machine.reject(stage, feedback).await?;
        self.persist(machine.context());
        Ok(state)
    }

    pub async fn fail(&self, project_id: Uuid, reason: &str) -> Result<PhaseState> {
        let machine = self.machine(project_id).await?;
        let mut machine = machine.lock().await;
        let state = machine.force_fail(reason)?;
        self.persist(machine.context());
        Ok(state)
    }

    pub async fn attach_tool(&self, project_id: Uuid, tool_id: &str) -> Result<ProjectContext> {
        let machine = self.machine(project_id).await?;
        let mut machine = machine.lock().await;
        machine.attach_tool(tool_id)?;
        self.persist(machine.context());
        Ok(machine.context().clone())
    }

    pub async fn get_context(&self, project_id: Uuid) -> Result<ProjectContext> {
        let machine = self.machine(project_id).await?;
        let machine = machine.lock().await;
        Ok(machine.context().clone())
    }

    pub async fn get_artifacts(&self, project_id: Uuid) -> Result<ProjectArtifacts> {
        Ok(self.get_context(project_id).await?.artifacts())
    }

    /// Snapshot of every project, oldest first.
    pub async fn list_projects(&self) -> Vec<ProjectContext> {
        let machines: Vec<Machine> = self.projects.read().await.values().cloned().collect();
        let mut contexts = Vec::with_capacity(machines.len());
        for machine in machines {
            contexts.push(machine.lock().await.context().clone());
        }
        contexts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.project_id.cmp(&b.project_id))
        });
        contexts
    }

    /// Fails every project that has waited for a human decision longer than
    /// the configured validation timeout. Returns the failed project ids.
    pub async fn expire_stale_validations(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let Some(timeout) = self.config.validation_timeout else {
            return Vec::new();
        };
        let Ok(limit) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };

        let machines: Vec<(Uuid, Machine)> = self
            .projects
            .read()
            .await
            .iter()
            .map(|(id, m)| (*id, m.clone()))
            .collect();

        let mut expired = Vec::new();
        for (project_id, machine) in machines {
            let mut machine = machine.lock().await;
            let ctx = machine.context();
            let Some(stage) = ctx.current_phase.stage().filter(|_| ctx.current_phase.is_validation()) else {
                continue;
            };
            if now - ctx.phase_entered_at <= limit {
                continue;
            }

            warn!(%project_id, stage = stage.as_str(), "validation timed out");
            match machine.force_fail(&format!("validation timed out for {}", stage.as_str())) {
                Ok(_) => {
                    self.persist(machine.context());
                    expired.push(project_id);
                }
                Err(err) => error!(%project_id, error = %err, "failed to expire project"),
            }
        }
        expired
    }

    /// Spawns the event loop: agent completions and human decisions from the
    /// bus are handed to a per-project worker as they arrive, and stale
    /// validations are expired on a timer. The subscription exists before
    /// this returns.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let inbox = self
            .bus
            .subscribe(&[topics::AGENT_COMPLETED, topics::HUMAN_VALIDATION]);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.event_loop(inbox).await })
    }

    async fn event_loop(self: Arc<Self>, mut inbox: Subscription) {
        let period = self
            .config
            .validation_timeout
            .map(|t| (t / 4).max(Duration::from_secs(1)))
            .unwrap_or(Duration::from_secs(60));
        let mut ticker = tokio::time::interval(period);
        let mut workers: HashMap<Uuid, UnboundedSender<VdwEvent>> = HashMap::new();

        info!("orchestrator event loop started");
        loop {
            tokio::select! {
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.route(&mut workers, envelope.event);
                }
                _ = ticker.tick() => {
                    workers.retain(|_, tx| !tx.is_closed());
                    self.expire_stale_validations(Utc::now()).await;
                }
            }
        }
        info!("orchestrator event loop stopped");
    }

    /// Queues `event` on its project's worker, starting one if needed.
    fn route(self: &Arc<Self>, workers: &mut HashMap<Uuid, UnboundedSender<VdwEvent>>, event: VdwEvent) {
        let project_id = event.project_id();
        let event = match workers.get(&project_id) {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        // A fresh channel with its receiver alive cannot refuse.
        let _ = tx.send(event);
        workers.insert(project_id, tx);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let topic = event.topic();
                match this.handle(event).await {
                    Ok(state) if state.is_terminal() => break,
                    Ok(_) => {}
                    Err(err) => warn!(%project_id, error = %err, topic, "event rejected"),
                }
            }
        });
    }

    async fn handle(&self, event: VdwEvent) -> Result<PhaseState> {
        match event {
            VdwEvent::AgentCompleted {
                project_id,
                stage,
                output,
            } => self.agent_completed(project_id, stage, output).await,
            VdwEvent::HumanValidation {
                project_id,
                stage,
                decision: ValidationDecision::Approve { feedback },
            } => self.approve(project_id, stage, feedback).await,
            VdwEvent::HumanValidation {
                project_id,
                stage,
                decision: ValidationDecision::Reject { feedback },
            } => self.reject(project_id, stage, &feedback).await,
            other => Err(VdwError::Validation(format!(
                "orchestrator does not handle {} events",
                other.topic()
            ))),
        }
    }

    async fn machine(&self, project_id: Uuid) -> Result<Machine> {
        self.projects
            .read()
            .await
            .get(&project_id)
            .cloned()
            .ok_or_else(|| VdwError::not_found("project", project_id.to_string()))
    }

    fn machine_for(&self, ctx: ProjectContext) -> PhaseStateMachine {
        let machine = PhaseStateMachine::new(
            ctx,
            self.bus.clone(),
            self.registry.clone(),
            self.oracle.clone(),
            self.config.clone(),
        );
        match &self.metrics {
            Some(metrics) => machine.with_metrics(metrics.metrics().clone()),
            None => machine,
        }
    }

    /// The in-memory transition has already happened; a failed write is logged
    /// and retried implicitly by the next successful save of this project.
    fn persist(&self, ctx: &ProjectContext) {
        if let Err(err) = self.db.save_project(ctx) {
            error!(project_id = %ctx.project_id, error = %err, "failed to persist project");
        }
    }
}
