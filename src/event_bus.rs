//! In-process topic fan-out between the orchestrator, phase agents and
//! human reviewers.
//!
//! Every subscriber owns an unbounded channel, so [`EventBus::publish`] never
//! waits on a slow consumer. Deliveries happen under one lock in publish
//! order, which gives each subscriber a per-project (in fact global) ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::models::{PhaseState, Stage};

pub mod topics {
    pub const PHASE_TRANSITION: &str = "phase.transition";
    pub const AGENT_DISPATCH: &str = "agent.dispatch";
    pub const AGENT_COMPLETED: &str = "agent.completed";
    pub const AGENT_CANCEL: &str = "agent.cancel";
    pub const HUMAN_VALIDATION: &str = "human.validation";
    pub const TOOLS_GAP: &str = "tools.gap";

    pub const ALL: [&str; 6] = [
        PHASE_TRANSITION,
        AGENT_DISPATCH,
        AGENT_COMPLETED,
        AGENT_CANCEL,
        HUMAN_VALIDATION,
        TOOLS_GAP,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationDecision {
    Approve {
        #[serde(default)]
        feedback: Option<String>,
    },
    Reject {
        feedback: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VdwEvent {
    PhaseTransition {
        project_id: Uuid,
        from: PhaseState,
        to: PhaseState,
        reason: String,
    },
    /// Asks the agent for `stage` to (re)do its work with everything it needs.
    AgentDispatch {
        project_id: Uuid,
        stage: Stage,
        initial_vibe: String,
        /// All feedback recorded so far, keyed by phase.
        feedback: BTreeMap<Stage, String>,
        previous_outputs: BTreeMap<Stage, serde_json::Value>,
        missing_capabilities: Vec<String>,
    },
    AgentCompleted {
        project_id: Uuid,
        stage: Stage,
        output: serde_json::Value,
    },
    AgentCancel {
        project_id: Uuid,
        reason: String,
    },
    HumanValidation {
        project_id: Uuid,
        stage: Stage,
        decision: ValidationDecision,
    },
    CapabilityGap {
        project_id: Uuid,
        stage: Stage,
        missing: Vec<String>,
        weak: Vec<String>,
    },
}

impl VdwEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::PhaseTransition { .. } => topics::PHASE_TRANSITION,
            Self::AgentDispatch { .. } => topics::AGENT_DISPATCH,
            Self::AgentCompleted { .. } => topics::AGENT_COMPLETED,
            Self::AgentCancel { .. } => topics::AGENT_CANCEL,
            Self::HumanValidation { .. } => topics::HUMAN_VALIDATION,
            Self::CapabilityGap { .. } => topics::TOOLS_GAP,
        }
    }

    pub fn project_id(&self) -> Uuid {
        match self {
            Self::PhaseTransition { project_id, .. }
            | Self::AgentDispatch { project_id, .. }
            | Self::AgentCompleted { project_id, .. }
            | Self::AgentCancel { project_id, .. }
            | Self::HumanValidation { project_id, .. }
            | Self::CapabilityGap { project_id, .. } => *project_id,
        }
    }
}

/// An event as delivered to a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub sequence: u64,
    pub topic: String,
    pub published_at: DateTime<Utc>,
    pub event: VdwEvent,
}

struct Subscriber {
    topics: BTreeSet<String>,
    tx: UnboundedSender<Envelope>,
}

#[derive(Default)]
struct Inner {
    sequence: u64,
    subscribers: Vec<Subscriber>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `topics`. The subscription lives until dropped.
    pub fn subscribe(&self, topics: &[&str]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.push(Subscriber {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            tx,
        });
        debug!(?topics, "new event bus subscriber");
        Subscription { rx }
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(&topics::ALL)
    }

    /// Fans `event` out to every live subscriber of its topic and returns how
    /// many received it. Dropped subscribers are pruned here.
    pub fn publish(&self, event: VdwEvent) -> usize {
        let topic = event.topic();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.sequence += 1;
        let envelope = Envelope {
            sequence: inner.sequence,
            topic: topic.to_string(),
            published_at: Utc::now(),
            event,
        };

        let mut delivered = 0;
        inner.subscribers.retain(|sub| {
            if !sub.topics.contains(topic) {
                return !sub.tx.is_closed();
            }
            match sub.tx.send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        trace!(topic, sequence = envelope.sequence, delivered, "published event");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.iter().filter(|s| !s.tx.is_closed()).count()
    }
}

pub struct Subscription {
    rx: UnboundedReceiver<Envelope>,
}

impl Subscription {
    /// Waits for the next event. `None` once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        match self.rx.try_recv() {
            Ok(envelope) => Some(envelope),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Everything already queued, oldest first.
    pub fn drain(&mut self) -> Vec<Envelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
