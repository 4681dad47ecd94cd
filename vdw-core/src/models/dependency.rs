use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Requires,
    Optional,
    /// Symmetric: stored in both directions.
    Conflicts,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requires => "requires",
            Self::Optional => "optional",
            Self::Conflicts => "conflicts",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "requires" => Some(Self::Requires),
            "optional" => Some(Self::Optional),
            "conflicts" => Some(Self::Conflicts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dependency {
    pub dependent_tool_id: String,
    pub dependency_tool_id: String,
    pub kind: DependencyKind,
}
