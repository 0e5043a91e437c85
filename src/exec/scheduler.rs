//! Hierarchical scheduler
//!
//! Runs a [`NodeTree`] as a tree of tokio tasks. Every node is an execution
//! unit that walks `Pending → Locking → Running → Completed`:
//!
//! - a unit acquires whatever part of its lock request its context chain
//!   does not already hold, in ascending key order, in one pass;
//! - hooks and leaf bodies run on blocking worker threads, each holding one
//!   permit of the run's worker pool while it runs;
//! - waiting for locks, or for children, holds no permit.
//!
//! The first node on a path that needs locks also takes every lock its
//! subtree declares from the run's registry, so nothing below it ever
//! waits on that registry again. Below it, each unit claims its request in
//! the child scope of its parent's context; siblings exclude each other
//! there exactly as they would in the run's registry.

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::aggregator::OutcomeAggregator;
use super::context::{CancellationHandle, ExecutionContext};
use super::events::{EventEmitter, EventSink, EventStream, ExecutionEvent, ExecutionRecord};
use super::outcome::{Outcome, SkipReason};
use crate::core::config::SchedulerConfig;
use crate::core::errors::{NodeError, Result, SchedulerError};
use crate::locks::{HeldLocks, LockRegistry, LockSet};
use crate::tree::{Callable, Node, NodeId, NodeTree};

/// Lifecycle of an execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Pending,
    Locking,
    Running,
    Completed,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Pending => write!(f, "pending"),
            UnitState::Locking => write!(f, "locking"),
            UnitState::Running => write!(f, "running"),
            UnitState::Completed => write!(f, "completed"),
        }
    }
}

/// Executes node trees against a shared lock registry.
///
/// Several runs may share one scheduler (and therefore one registry); their
/// units then exclude each other exactly like units of the same run.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<LockRegistry>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(LockRegistry::new()),
            sinks: Vec::new(),
        })
    }

    /// Use an externally owned registry
    pub fn with_registry(mut self, registry: Arc<LockRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Attach an observer that sees every record of every run
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    /// Start executing `tree` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, tree: &NodeTree) -> RunHandle {
        let run_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Arc::new(EventEmitter::new(run_id.clone(), tx, self.sinks.clone()));
        let cancellation = CancellationHandle::new();

        let states = Arc::new(DashMap::new());
        for node in tree.iter() {
            states.insert(node.id().to_string(), UnitState::Pending);
        }

        let pool_size = self.config.effective_pool_size();
        info!(
            run_id = %run_id,
            nodes = tree.len(),
            pool_size,
            parallel = self.config.parallel_enabled,
            "Starting run"
        );

        let state = Arc::new(RunState {
            registry: self.registry.clone(),
            pool: Arc::new(Semaphore::new(pool_size)),
            aggregator: OutcomeAggregator::new(emitter.clone()),
            emitter: emitter.clone(),
            cancellation: cancellation.clone(),
            states: states.clone(),
            parallel: self.config.parallel_enabled,
        });
        let run_ctx = ExecutionContext::for_run(run_id.clone(), cancellation.clone(), emitter);
        let root = tree.root().clone();

        let task_run_id = run_id.clone();
        let task = tokio::spawn(async move {
            let outcome = run_unit(state, root, run_ctx).await;
            info!(run_id = %task_run_id, outcome = %outcome, "Run finished");
            outcome
        });

        RunHandle {
            run_id,
            cancellation,
            events: Some(EventStream::new(rx)),
            states,
            task,
        }
    }

    /// Run `tree` to completion and collect every record it produced
    pub async fn execute(&self, tree: &NodeTree) -> Result<RunReport> {
        let mut handle = self.spawn(tree);
        let run_id = handle.run_id().to_string();
        let events = handle
            .take_events()
            .ok_or_else(|| SchedulerError::internal("event stream already taken"))?;

        let (outcome, records) = tokio::join!(handle.wait(), events.collect::<Vec<_>>());
        Ok(RunReport {
            run_id,
            outcome: outcome?,
            records,
            leaf_ids: tree.leaf_ids(),
        })
    }
}

/// Control surface of a background run
pub struct RunHandle {
    run_id: String,
    cancellation: CancellationHandle,
    events: Option<EventStream>,
    states: Arc<DashMap<NodeId, UnitState>>,
    task: JoinHandle<Outcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    /// Skip every unit that has not started running yet
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// The run's live record stream; `None` once taken
    pub fn take_events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    pub fn unit_state(&self, id: &str) -> Option<UnitState> {
        self.states.get(id).map(|entry| *entry.value())
    }

    /// Wait for the root's terminal outcome
    pub async fn wait(self) -> Result<Outcome> {
        self.task
            .await
            .map_err(|e| SchedulerError::internal_with_source("scheduler task failed", e))
    }
}

/// Everything the units of one run share
struct RunState {
    registry: Arc<LockRegistry>,
    pool: Arc<Semaphore>,
    aggregator: OutcomeAggregator,
    emitter: Arc<EventEmitter>,
    cancellation: CancellationHandle,
    states: Arc<DashMap<NodeId, UnitState>>,
    parallel: bool,
}

impl RunState {
    fn transition(&self, id: &str, next: UnitState) {
        debug!(node = %id, state = %next, "Unit state change");
        self.states.insert(id.to_string(), next);
    }

    fn mark_subtree_completed(&self, node: &Node) {
        for child in node.children() {
            self.mark_subtree_completed(child);
        }
        self.states.insert(node.id().to_string(), UnitState::Completed);
    }

    fn skip(&self, node: &Node, parent: Option<&str>, reason: SkipReason) -> Outcome {
        debug!(node = %node.id(), reason = %reason, "Skipping subtree");
        self.mark_subtree_completed(node);
        self.aggregator.skip_subtree(node, parent, reason.clone());
        Outcome::Skipped(reason)
    }

    /// Fail `node` before it ran; its children never start.
    fn fail_unstarted(&self, node: &Node, parent: Option<&str>, err: NodeError) -> Outcome {
        warn!(node = %node.id(), error = %err, "Unit failed before running");
        if node.is_leaf() {
            self.transition(node.id(), UnitState::Completed);
            let outcome = Outcome::failure(err);
            self.aggregator.report(node.id(), parent, outcome.clone());
            return outcome;
        }

        self.aggregator
            .open_container(node.id(), node.children().len());
        self.skip_children(node);
        self.aggregator.record_failure(node.id(), err);
        self.transition(node.id(), UnitState::Completed);
        self.aggregator.close_container(node.id(), parent)
    }

    fn skip_children(&self, node: &Node) {
        let reason = SkipReason::ParentFailed {
            parent: node.id().to_string(),
        };
        for child in node.children() {
            self.skip(child, Some(node.id()), reason.clone());
        }
    }

    fn start(&self, node: &Node, locks: &UnitLocks) {
        self.transition(node.id(), UnitState::Running);
        self.emitter.emit(
            node.id(),
            ExecutionEvent::Started {
                kind: node.kind(),
                acquired_locks: locks.acquired(),
            },
        );
    }

    async fn acquire_worker(&self) -> std::result::Result<OwnedSemaphorePermit, NodeError> {
        self.pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| NodeError::Aborted {
                message: "worker pool closed".to_string(),
            })
    }
}

/// Locks held by one unit: claims in its parent's child scope, and what it
/// took from the run's registry (non-empty only for lock roots).
struct UnitLocks {
    _scoped: HeldLocks,
    run: HeldLocks,
}

impl UnitLocks {
    /// Keys newly taken from the run's registry
    fn acquired(&self) -> LockSet {
        self.run.lock_set()
    }
}

fn run_unit(
    state: Arc<RunState>,
    node: Arc<Node>,
    parent_ctx: Arc<ExecutionContext>,
) -> BoxFuture<'static, Outcome> {
    async move {
        let parent_id = parent_ctx.node_id().map(str::to_string);
        let parent = parent_id.as_deref();

        if state.cancellation.is_cancelled() {
            return state.skip(&node, parent, SkipReason::Cancelled);
        }

        state.transition(node.id(), UnitState::Locking);
        let request = node.lock_request();
        let missing = match parent_ctx.missing_locks(&request) {
            Ok(missing) => missing,
            Err(err) => return state.fail_unstarted(&node, parent, err),
        };
        let run = state.registry.acquire(&missing).await;
        let scoped = match parent_ctx.child_scope() {
            Some(scope) => scope.acquire(&request).await,
            None => HeldLocks::empty(),
        };
        let locks = UnitLocks {
            _scoped: scoped,
            run,
        };
        let ctx = parent_ctx.child(node.id(), &missing);

        if node.is_leaf() {
            run_leaf(&state, &node, ctx, parent, locks).await
        } else {
            run_container(&state, &node, ctx, parent, locks).await
        }
    }
    .boxed()
}

async fn run_leaf(
    state: &Arc<RunState>,
    node: &Arc<Node>,
    ctx: Arc<ExecutionContext>,
    parent: Option<&str>,
    locks: UnitLocks,
) -> Outcome {
    let permit = match state.acquire_worker().await {
        Ok(permit) => permit,
        Err(err) => return state.fail_unstarted(node, parent, err),
    };
    if ctx.is_cancelled() {
        return state.skip(node, parent, SkipReason::Cancelled);
    }

    state.start(node, &locks);

    let mut causes = Vec::new();
    match run_before_hooks(node, &ctx).await {
        Some(err) => causes.push(err),
        None => {
            if let Some(body) = node.body() {
                if let Err(message) = invoke(body.clone(), ctx.clone()).await {
                    warn!(node = %node.id(), error = %message, "Test body failed");
                    causes.push(NodeError::body(message));
                }
            }
        }
    }
    causes.extend(run_after_hooks(node, &ctx).await);
    drop(permit);

    let outcome = if causes.is_empty() {
        Outcome::Success
    } else {
        Outcome::Failure(causes)
    };
    state.transition(node.id(), UnitState::Completed);
    // Reported while the locks are still held
    state.aggregator.report(node.id(), parent, outcome.clone());
    drop(locks);
    outcome
}

async fn run_container(
    state: &Arc<RunState>,
    node: &Arc<Node>,
    ctx: Arc<ExecutionContext>,
    parent: Option<&str>,
    locks: UnitLocks,
) -> Outcome {
    if ctx.is_cancelled() {
        return state.skip(node, parent, SkipReason::Cancelled);
    }

    state.start(node, &locks);
    state
        .aggregator
        .open_container(node.id(), node.children().len());

    let before = if node.before_hooks().is_empty() {
        None
    } else {
        match state.acquire_worker().await {
            Ok(_permit) => run_before_hooks(node, &ctx).await,
            Err(err) => Some(err),
        }
    };

    match before {
        Some(err) => {
            state.aggregator.record_failure(node.id(), err);
            state.skip_children(node);
        }
        None => run_children(state, node, &ctx).await,
    }

    if !node.after_hooks().is_empty() {
        match state.acquire_worker().await {
            Ok(_permit) => {
                for err in run_after_hooks(node, &ctx).await {
                    state.aggregator.record_failure(node.id(), err);
                }
            }
            Err(err) => state.aggregator.record_failure(node.id(), err),
        }
    }

    state.transition(node.id(), UnitState::Completed);
    let outcome = state.aggregator.close_container(node.id(), parent);
    drop(locks);
    outcome
}

async fn run_children(state: &Arc<RunState>, node: &Arc<Node>, ctx: &Arc<ExecutionContext>) {
    if !state.parallel {
        debug!(node = %node.id(), children = node.children().len(), "Running children sequentially");
        for child in node.children() {
            run_unit(state.clone(), child.clone(), ctx.clone()).await;
        }
        return;
    }

    let handles = node.children().iter().map(|child| {
        let handle = tokio::spawn(run_unit(state.clone(), child.clone(), ctx.clone()));
        let child = child.clone();
        async move { (child, handle.await) }
    });

    for (child, result) in join_all(handles).await {
        if let Err(err) = result {
            error!(node = %child.id(), error = %err, "Unit task failed");
            if state.aggregator.outcome(child.id()).is_none() {
                state.transition(child.id(), UnitState::Completed);
                state.aggregator.report(
                    child.id(),
                    Some(node.id()),
                    Outcome::failure(NodeError::Aborted {
                        message: err.to_string(),
                    }),
                );
            }
        }
    }
}

/// Run before hooks in order, stopping at the first failure
async fn run_before_hooks(node: &Node, ctx: &Arc<ExecutionContext>) -> Option<NodeError> {
    for hook in node.before_hooks() {
        if let Err(message) = invoke(hook.clone(), ctx.clone()).await {
            warn!(node = %node.id(), error = %message, "Before hook failed");
            return Some(NodeError::before_hook(message));
        }
    }
    None
}

/// Run every after hook, collecting all failures
async fn run_after_hooks(node: &Node, ctx: &Arc<ExecutionContext>) -> Vec<NodeError> {
    let mut failures = Vec::new();
    for hook in node.after_hooks() {
        if let Err(message) = invoke(hook.clone(), ctx.clone()).await {
            warn!(node = %node.id(), error = %message, "After hook failed");
            failures.push(NodeError::after_hook(message));
        }
    }
    failures
}

async fn invoke(callable: Callable, ctx: Arc<ExecutionContext>) -> std::result::Result<(), String> {
    match tokio::task::spawn_blocking(move || callable(&ctx)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(err) if err.is_panic() => Err(panic_message(err.into_panic())),
        Err(err) => Err(err.to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

/// Leaf counts of a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Complete record of one finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    /// Terminal outcome of the root
    pub outcome: Outcome,
    /// Every record, in sequence order
    pub records: Vec<ExecutionRecord>,
    leaf_ids: Vec<NodeId>,
}

impl RunReport {
    pub fn records_for<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a ExecutionRecord> + 'a {
        let id = id.to_string();
        self.records.iter().filter(move |record| record.node_id == id)
    }

    pub fn started(&self, id: &str) -> Option<&ExecutionRecord> {
        self.records_for(id).find(|record| record.is_started())
    }

    pub fn finished(&self, id: &str) -> Option<&ExecutionRecord> {
        self.records_for(id).find(|record| record.outcome().is_some())
    }

    pub fn outcome_of(&self, id: &str) -> Option<&Outcome> {
        self.finished(id).and_then(|record| record.outcome())
    }

    /// Sequence numbers of the node's Started and Finished records
    pub fn interval(&self, id: &str) -> Option<(u64, u64)> {
        Some((self.started(id)?.sequence, self.finished(id)?.sequence))
    }

    /// Report entries published for `id`, in publication order
    pub fn report_entries(&self, id: &str) -> Vec<(&str, &str)> {
        self.records_for(id)
            .filter_map(|record| record.report_entry())
            .collect()
    }

    /// Distinct threads that published report entries
    pub fn threads(&self) -> BTreeSet<&str> {
        self.records
            .iter()
            .filter(|record| record.report_entry().is_some())
            .map(|record| record.thread.as_str())
            .collect()
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.leaf_ids.len(),
            ..Default::default()
        };
        for id in &self.leaf_ids {
            match self.outcome_of(id) {
                Some(Outcome::Success) => summary.succeeded += 1,
                Some(Outcome::Failure(_)) => summary.failed += 1,
                Some(Outcome::Skipped(_)) => summary.skipped += 1,
                None => {}
            }
        }
        summary
    }
}
