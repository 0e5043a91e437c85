//! Concurrent, lock-scoped execution of hierarchical test trees.
//!
//! A [`NodeTree`] of containers and leaves is built once with
//! [`TreeBuilder`], then handed to a [`Scheduler`], which runs independent
//! subtrees concurrently while honouring declared [`AccessMode::Shared`] /
//! [`AccessMode::Exclusive`] resource requirements.
//!
//! ```no_run
//! use treeexec::{NodeSpec, Scheduler, SchedulerConfig, TreeBuilder};
//!
//! # async fn run() -> treeexec::Result<()> {
//! let tree = TreeBuilder::new("suite")
//!     .node(NodeSpec::container("suite").with_children(["reads", "writes"]))
//!     .node(NodeSpec::leaf("reads", |_| Ok(())).shared("db"))
//!     .node(NodeSpec::leaf("writes", |_| Ok(())).exclusive("db"))
//!     .build()?;
//!
//! let report = Scheduler::new(SchedulerConfig::default())?
//!     .execute(&tree)
//!     .await?;
//! assert!(report.outcome.is_success());
//! # Ok(())
//! # }
//! ```

// Ambient infrastructure
pub mod core;

pub mod exec;
pub mod locks;
pub mod tree;

// Re-exports for convenience
pub use crate::core::config::SchedulerConfig;
pub use crate::core::errors::{HookPhase, NodeError, Result, SchedulerError, StructuralError};
pub use crate::core::telemetry::{init_tracing, try_init_tracing};
pub use crate::exec::{
    BufferingEventSink, CancellationHandle, EventSink, EventStream, ExecutionContext,
    ExecutionEvent, ExecutionRecord, LoggingEventSink, Outcome, RunHandle, RunReport, RunSummary,
    Scheduler, SkipReason, UnitState,
};
pub use crate::locks::{AccessMode, LockRegistry, LockSet, ResourceRequirement};
pub use crate::tree::{NodeId, NodeKind, NodeSpec, NodeTree, ResourceKey, TreeBuilder};
