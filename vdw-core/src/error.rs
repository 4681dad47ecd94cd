use thiserror::Error;

/// Errors raised by the registry, the project store and the phase workflow.
///
/// Validation, cycle and conflict errors are always raised before any row is
/// written, so a caller that receives one can assume the store is unchanged.
#[derive(Debug, Error)]
pub enum VdwError {
    /// Illegal phase transition or malformed registration input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A `requires` edge or a replacement link would close a cycle.
    #[error("cycle detected: {0}")]
    Cycle(String),

    /// Two tools in a resolved set are linked by a `conflicts` edge.
    #[error("tools {first} and {second} conflict")]
    Conflict { first: String, second: String },

    /// No eligible tool provides the requested capability.
    #[error("no eligible tool provides capability '{0}'")]
    Gap(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The reasoning oracle timed out or could not be reached.
    #[error("reasoning oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// The store stayed busy for every retry of a write transaction.
    #[error("write retries exhausted after {attempts} attempts")]
    Concurrency { attempts: u32 },

    /// A persisted value could not be decoded back into its model type.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl VdwError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Builds a conflict error with the pair in lexical order so reports are stable.
    pub fn conflict(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self::Conflict {
                first: a,
                second: b,
            }
        } else {
            Self::Conflict {
                first: b,
                second: a,
            }
        }
    }

    /// True for errors that leave the caller's request unapplied by rule
    /// rather than by an infrastructure fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Cycle(_) | Self::Conflict { .. } | Self::Gap(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VdwError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_orders_pair_lexically() {
        match VdwError::conflict("tool-b", "tool-a") {
            VdwError::Conflict { first, second } => {
                assert_eq!(first, "tool-a");
                assert_eq!(second, "tool-b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn not_found_message_names_kind_and_id() {
        let err = VdwError::not_found("tool", "abc");
        assert_eq!(err.to_string(), "tool not found: abc");
        assert!(!err.is_rejection());
    }
}
