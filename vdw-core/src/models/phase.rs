use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the five fixed stages of the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Mood,
    Architecture,
    Specification,
    Implementation,
    ValidationTesting,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Mood,
        Stage::Architecture,
        Stage::Specification,
        Stage::Implementation,
        Stage::ValidationTesting,
    ];

    /// 1-based position in the pipeline.
    pub fn number(&self) -> u8 {
        match self {
            Self::Mood => 1,
            Self::Architecture => 2,
            Self::Specification => 3,
            Self::Implementation => 4,
            Self::ValidationTesting => 5,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Mood),
            2 => Some(Self::Architecture),
            3 => Some(Self::Specification),
            4 => Some(Self::Implementation),
            5 => Some(Self::ValidationTesting),
            _ => None,
        }
    }

    /// The stage that follows this one, `None` after the last stage.
    pub fn next(&self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mood => "mood",
            Self::Architecture => "architecture",
            Self::Specification => "specification",
            Self::Implementation => "implementation",
            Self::ValidationTesting => "validation_testing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "mood" => Some(Self::Mood),
            "architecture" => Some(Self::Architecture),
            "specification" => Some(Self::Specification),
            "implementation" => Some(Self::Implementation),
            "validation_testing" => Some(Self::ValidationTesting),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {} ({})", self.number(), self.as_str())
    }
}

/// The thirteen workflow states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum PhaseState {
    Idle,
    Work(Stage),
    Validation(Stage),
    Completed,
    Failed,
}

/// Inputs that move a project through the workflow graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEvent {
    Start,
    WorkCompleted,
    Approved,
    Rejected,
    Abort,
}

const GRAPH_EVENTS: [PhaseEvent; 4] = [
    PhaseEvent::Start,
    PhaseEvent::WorkCompleted,
    PhaseEvent::Approved,
    PhaseEvent::Rejected,
];

impl PhaseState {
    pub const ALL: [PhaseState; 13] = [
        PhaseState::Idle,
        PhaseState::Work(Stage::Mood),
        PhaseState::Validation(Stage::Mood),
        PhaseState::Work(Stage::Architecture),
        PhaseState::Validation(Stage::Architecture),
        PhaseState::Work(Stage::Specification),
        PhaseState::Validation(Stage::Specification),
        PhaseState::Work(Stage::Implementation),
        PhaseState::Validation(Stage::Implementation),
        PhaseState::Work(Stage::ValidationTesting),
        PhaseState::Validation(Stage::ValidationTesting),
        PhaseState::Completed,
        PhaseState::Failed,
    ];

    /// The transition table. `Abort` is the operator override and reaches
    /// `Failed` from every state except `Failed` itself.
    pub fn next(self, event: PhaseEvent) -> Option<PhaseState> {
        use PhaseEvent::*;
        use PhaseState::*;

        match (self, event) {
            (Idle, Start) => Some(Work(Stage::Mood)),
            (Work(stage), WorkCompleted) => Some(Validation(stage)),
            (Validation(stage), Approved) => Some(stage.next().map_or(Completed, Work)),
            (Validation(stage), Rejected) => Some(Work(stage)),
            (Failed, Abort) => None,
            (_, Abort) => Some(Failed),
            _ => None,
        }
    }

    /// States reachable in one step through the fixed graph (operator abort excluded).
    pub fn successors(self) -> Vec<PhaseState> {
        GRAPH_EVENTS
            .iter()
            .filter_map(|event| self.next(*event))
            .collect()
    }

    pub fn can_transition_to(self, target: PhaseState) -> bool {
        self.event_towards(target).is_some()
    }

    /// The graph event that moves `self` to `target`, if they are adjacent.
    pub fn event_towards(self, target: PhaseState) -> Option<PhaseEvent> {
        GRAPH_EVENTS
            .iter()
            .copied()
            .find(|event| self.next(*event) == Some(target))
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Work(stage) | Self::Validation(stage) => Some(*stage),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn as_string(&self) -> String {
        match self {
            Self::Idle => "IDLE".to_string(),
            Self::Work(stage) => format!("PHASE_{}_WORK", stage.number()),
            Self::Validation(stage) => format!("PHASE_{}_VALIDATION", stage.number()),
            Self::Completed => "COMPLETED".to_string(),
            Self::Failed => "FAILED".to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => return Some(Self::Idle),
            "COMPLETED" => return Some(Self::Completed),
            "FAILED" => return Some(Self::Failed),
            _ => {}
        }
        let rest = s.strip_prefix("PHASE_")?;
        let (number, kind) = rest.split_once('_')?;
        let stage = Stage::from_number(number.parse().ok()?)?;
        match kind {
            "WORK" => Some(Self::Work(stage)),
            "VALIDATION" => Some(Self::Validation(stage)),
            _ => None,
        }
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<PhaseState> for String {
    fn from(state: PhaseState) -> Self {
        state.as_string()
    }
}

impl TryFrom<String> for PhaseState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown phase state '{value}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_round_trips_through_its_name() {
        for state in PhaseState::ALL {
            assert_eq!(PhaseState::parse(&state.as_string()), Some(state));
        }
        assert_eq!(PhaseState::parse("PHASE_6_WORK"), None);
        assert_eq!(PhaseState::parse("PHASE_1_REVIEW"), None);
    }

    #[test]
    fn validation_has_exactly_forward_and_rework_edges() {
        let state = PhaseState::Validation(Stage::Architecture);
        assert_eq!(
            state.successors(),
            vec![
                PhaseState::Work(Stage::Specification),
                PhaseState::Work(Stage::Architecture)
            ]
        );
        assert_eq!(
            PhaseState::Validation(Stage::ValidationTesting).successors(),
            vec![PhaseState::Completed, PhaseState::Work(Stage::ValidationTesting)]
        );
    }

    #[test]
    fn graph_never_skips_a_phase() {
        for from in PhaseState::ALL {
            for to in from.successors() {
                match (from.stage(), to.stage()) {
                    (Some(a), Some(b)) => {
                        assert!(b.number() == a.number() || b.number() == a.number() + 1)
                    }
                    (None, Some(b)) => assert_eq!(b, Stage::Mood),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        assert!(PhaseState::Completed.successors().is_empty());
        assert!(PhaseState::Failed.successors().is_empty());
        assert_eq!(
            PhaseState::Completed.next(PhaseEvent::Abort),
            Some(PhaseState::Failed)
        );
        assert_eq!(PhaseState::Failed.next(PhaseEvent::Abort), None);
    }

    #[test]
    fn serializes_as_upper_snake_names() {
        let json = serde_json::to_string(&PhaseState::Validation(Stage::Mood)).unwrap();
        assert_eq!(json, "\"PHASE_1_VALIDATION\"");
        let back: PhaseState = serde_json::from_str("\"PHASE_4_WORK\"").unwrap();
        assert_eq!(back, PhaseState::Work(Stage::Implementation));
    }
}
