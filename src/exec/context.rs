use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::events::{EventEmitter, ExecutionEvent};
use crate::core::errors::NodeError;
use crate::locks::{AccessMode, LockRegistry, LockSet};
use crate::tree::NodeId;

/// Run-wide cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units that have not started running yet will be skipped.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::info!("Run cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-node execution context, chained to its parent's.
///
/// Carries the locks held along the chain so descendants can tell which
/// requirements are already satisfied, plus the run's cancellation flag.
/// Hooks and bodies receive it and may publish report entries through it.
///
/// A context holding locks also owns a child scope: a registry private to
/// its children, in which they claim the keys the chain holds on their
/// behalf. Siblings therefore still exclude each other on inherited and
/// hoisted keys, and only where their modes actually conflict.
pub struct ExecutionContext {
    run_id: String,
    node_id: Option<NodeId>,
    parent: Option<Arc<ExecutionContext>>,
    held_locks: LockSet,
    child_scope: Option<Arc<LockRegistry>>,
    cancellation: CancellationHandle,
    emitter: Arc<EventEmitter>,
}

impl ExecutionContext {
    /// Context at the top of the chain, above the root node
    pub(crate) fn for_run(
        run_id: impl Into<String>,
        cancellation: CancellationHandle,
        emitter: Arc<EventEmitter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            run_id: run_id.into(),
            node_id: None,
            parent: None,
            held_locks: LockSet::new(),
            child_scope: None,
            cancellation,
            emitter,
        })
    }

    /// Context for `node_id`, which just acquired `acquired` on top of ours
    pub(crate) fn child(self: &Arc<Self>, node_id: &str, acquired: &LockSet) -> Arc<Self> {
        let held_locks = self.held_locks.merged(acquired);
        let child_scope = if held_locks.is_empty() {
            None
        } else {
            Some(Arc::new(LockRegistry::new()))
        };
        Arc::new(Self {
            run_id: self.run_id.clone(),
            node_id: Some(node_id.to_string()),
            parent: Some(self.clone()),
            held_locks,
            child_scope,
            cancellation: self.cancellation.clone(),
            emitter: self.emitter.clone(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// `None` only for the run-level context
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn parent(&self) -> Option<&Arc<ExecutionContext>> {
        self.parent.as_ref()
    }

    pub fn ancestors(&self) -> impl Iterator<Item = &ExecutionContext> {
        std::iter::successors(self.parent.as_deref(), |ctx| ctx.parent.as_deref())
    }

    /// Number of node contexts above this one
    pub fn depth(&self) -> usize {
        self.ancestors().filter(|ctx| ctx.node_id.is_some()).count()
    }

    /// Everything held by this unit and its ancestors
    pub fn held_locks(&self) -> &LockSet {
        &self.held_locks
    }

    pub fn holds(&self, key: &str) -> Option<AccessMode> {
        self.held_locks.get(key)
    }

    /// Registry in which this node's children claim held keys
    pub(crate) fn child_scope(&self) -> Option<&Arc<LockRegistry>> {
        self.child_scope.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationHandle {
        &self.cancellation
    }

    /// Publish a key/value report entry attributed to this node
    pub fn publish_entry(&self, key: impl Into<String>, value: impl Into<String>) {
        let node_id = self.node_id.as_deref().unwrap_or(&self.run_id);
        self.emitter.emit(
            node_id,
            ExecutionEvent::ReportingEntryPublished {
                key: key.into(),
                value: value.into(),
            },
        );
    }

    /// The part of `wanted` this chain does not hold yet.
    ///
    /// Keys held in a mode that covers the request are skipped, which is
    /// what keeps a descendant from deadlocking on its ancestor's lock.
    pub(crate) fn missing_locks(&self, wanted: &LockSet) -> Result<LockSet, NodeError> {
        let mut missing = LockSet::new();
        for (key, mode) in wanted {
            match self.held_locks.get(key) {
                None => missing.insert(key.clone(), *mode),
                Some(held) if held.covers(*mode) => {}
                Some(_) => return Err(NodeError::LockUpgrade { key: key.clone() }),
            }
        }
        Ok(missing)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .field("held_locks", &self.held_locks)
            .field("cancelled", &self.is_cancelled())
            .field("depth", &self.depth())
            .finish()
    }
}
