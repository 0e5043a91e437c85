use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::locks::AccessMode;
use crate::tree::{NodeId, ResourceKey};

/// Result alias used by the scheduler-facing API
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that abort a run (or prevent one from starting).
///
/// Node-level failures never surface here; they are reported as
/// [`crate::Outcome::Failure`] through the event stream instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The node tree is malformed
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SchedulerError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error with source
    pub fn internal_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Structural(_))
    }
}

/// Defects in the discovered tree, detected before any unit starts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("Cycle detected in node tree involving '{node_id}'")]
    Cycle { node_id: NodeId },

    #[error("Duplicate node id: '{node_id}'")]
    DuplicateId { node_id: NodeId },

    #[error("Node '{parent}' references unknown child '{child}'")]
    UnknownChild { parent: NodeId, child: NodeId },

    #[error("Node '{child}' has more than one parent ('{first}' and '{second}')")]
    MultipleParents {
        child: NodeId,
        first: NodeId,
        second: NodeId,
    },

    #[error("Node '{node_id}' is not reachable from root '{root}'")]
    Unreachable { node_id: NodeId, root: NodeId },

    #[error("Root node '{root}' was not declared")]
    MissingRoot { root: NodeId },

    #[error("Leaf '{node_id}' declares children")]
    LeafWithChildren { node_id: NodeId },

    #[error("Node '{node_id}' references unknown resource key '{key}'")]
    UnknownResource { node_id: NodeId, key: ResourceKey },

    #[error(
        "Node '{node_id}' requests {requested} access to '{key}' but ancestor '{ancestor}' declares {held}"
    )]
    ModeConflict {
        node_id: NodeId,
        key: ResourceKey,
        ancestor: NodeId,
        requested: AccessMode,
        held: AccessMode,
    },
}

/// Which hook list a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Before,
    After,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Before => write!(f, "before"),
            HookPhase::After => write!(f, "after"),
        }
    }
}

/// Cause attached to a failed node
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    #[error("{phase} hook failed: {message}")]
    Hook { phase: HookPhase, message: String },

    #[error("test body failed: {message}")]
    Body { message: String },

    #[error("{failed} of {total} children failed")]
    Children { failed: usize, total: usize },

    /// An inherited Shared hold would have to be upgraded to Exclusive
    #[error("cannot upgrade inherited shared lock on '{key}' to exclusive")]
    LockUpgrade { key: ResourceKey },

    #[error("execution aborted: {message}")]
    Aborted { message: String },
}

impl NodeError {
    pub fn before_hook<S: Into<String>>(message: S) -> Self {
        Self::Hook {
            phase: HookPhase::Before,
            message: message.into(),
        }
    }

    pub fn after_hook<S: Into<String>>(message: S) -> Self {
        Self::Hook {
            phase: HookPhase::After,
            message: message.into(),
        }
    }

    pub fn body<S: Into<String>>(message: S) -> Self {
        Self::Body {
            message: message.into(),
        }
    }

    pub fn is_hook_failure(&self) -> bool {
        matches!(self, Self::Hook { .. })
    }
}
