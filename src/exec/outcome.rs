use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::errors::NodeError;
use crate::tree::NodeId;

/// Why a node never ran (or, for containers, why none of its children did)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The run was cancelled before the unit started
    Cancelled,
    /// An ancestor's before hook (or lock setup) failed
    ParentFailed { parent: NodeId },
    /// Every child of a container was skipped
    AllChildrenSkipped,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Cancelled => write!(f, "cancelled"),
            SkipReason::ParentFailed { parent } => write!(f, "parent '{parent}' failed"),
            SkipReason::AllChildrenSkipped => write!(f, "all children skipped"),
        }
    }
}

/// Terminal result of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure(Vec<NodeError>),
    Skipped(SkipReason),
}

impl Outcome {
    pub fn failure(error: NodeError) -> Self {
        Outcome::Failure(vec![error])
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    pub fn causes(&self) -> &[NodeError] {
        match self {
            Outcome::Failure(causes) => causes,
            _ => &[],
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            Outcome::Skipped(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "SUCCESS"),
            Outcome::Failure(causes) => {
                write!(f, "FAILURE")?;
                for (i, cause) in causes.iter().enumerate() {
                    let sep = if i == 0 { ": " } else { "; " };
                    write!(f, "{sep}{cause}")?;
                }
                Ok(())
            }
            Outcome::Skipped(reason) => write!(f, "SKIPPED ({reason})"),
        }
    }
}
