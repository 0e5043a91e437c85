use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::events::{EventEmitter, ExecutionEvent};
use super::outcome::{Outcome, SkipReason};
use crate::core::errors::NodeError;
use crate::tree::{Node, NodeId};

/// Running aggregate for one open container
#[derive(Debug, Default)]
struct PendingContainer {
    total: usize,
    remaining: usize,
    failed: usize,
    skipped: usize,
    cancelled: usize,
    /// The container's own hook failures
    failures: Vec<NodeError>,
}

impl PendingContainer {
    fn absorb(&mut self, outcome: &Outcome) {
        self.remaining = self.remaining.saturating_sub(1);
        match outcome {
            Outcome::Success => {}
            Outcome::Failure(_) => self.failed += 1,
            Outcome::Skipped(reason) => {
                self.skipped += 1;
                if *reason == SkipReason::Cancelled {
                    self.cancelled += 1;
                }
            }
        }
    }

    fn outcome(self) -> Outcome {
        let mut causes = self.failures;
        if self.failed > 0 {
            causes.push(NodeError::Children {
                failed: self.failed,
                total: self.total,
            });
        }

        if !causes.is_empty() {
            Outcome::Failure(causes)
        } else if self.total > 0 && self.skipped == self.total {
            if self.cancelled == self.total {
                Outcome::Skipped(SkipReason::Cancelled)
            } else {
                Outcome::Skipped(SkipReason::AllChildrenSkipped)
            }
        } else {
            Outcome::Success
        }
    }
}

/// Rolls child outcomes up into container outcomes.
///
/// Outcomes arrive in completion order, not tree order. Every terminal
/// outcome is emitted as an [`ExecutionEvent::Finished`] record; a
/// container's own record is only emitted by [`close_container`], after all
/// of its children reported and its after hooks ran.
///
/// [`close_container`]: OutcomeAggregator::close_container
pub struct OutcomeAggregator {
    pending: DashMap<NodeId, PendingContainer>,
    outcomes: DashMap<NodeId, Outcome>,
    emitter: Arc<EventEmitter>,
}

impl OutcomeAggregator {
    pub(crate) fn new(emitter: Arc<EventEmitter>) -> Self {
        Self {
            pending: DashMap::new(),
            outcomes: DashMap::new(),
            emitter,
        }
    }

    /// Start tracking a container expecting `child_count` reports
    pub fn open_container(&self, id: &str, child_count: usize) {
        self.pending.insert(
            id.to_string(),
            PendingContainer {
                total: child_count,
                remaining: child_count,
                ..Default::default()
            },
        );
    }

    /// Attach a hook failure to an open container
    pub fn record_failure(&self, id: &str, error: NodeError) {
        match self.pending.get_mut(id) {
            Some(mut entry) => entry.failures.push(error),
            None => warn!(node = %id, error = %error, "Failure reported for a container that is not open"),
        }
    }

    /// Record a terminal outcome and forward it to the parent's aggregate
    pub fn report(&self, id: &str, parent: Option<&str>, outcome: Outcome) {
        debug!(node = %id, outcome = %outcome, "Outcome recorded");
        self.outcomes.insert(id.to_string(), outcome.clone());

        if let Some(parent) = parent {
            if let Some(mut entry) = self.pending.get_mut(parent) {
                entry.absorb(&outcome);
            }
        }

        self.emitter.emit(id, ExecutionEvent::Finished { outcome });
    }

    /// Compute, record and emit the container's terminal outcome
    pub fn close_container(&self, id: &str, parent: Option<&str>) -> Outcome {
        let entry = match self.pending.remove(id) {
            Some((_, entry)) => entry,
            None => {
                warn!(node = %id, "Closing a container that was never opened");
                PendingContainer::default()
            }
        };
        if entry.remaining > 0 {
            warn!(node = %id, remaining = entry.remaining, "Container closed with children still pending");
        }

        let outcome = entry.outcome();
        self.report(id, parent, outcome.clone());
        outcome
    }

    /// Report `node` and its whole subtree as skipped, children first
    pub fn skip_subtree(&self, node: &Node, parent: Option<&str>, reason: SkipReason) {
        for child in node.children() {
            self.skip_subtree(child, Some(node.id()), reason.clone());
        }
        self.report(node.id(), parent, Outcome::Skipped(reason));
    }

    pub fn outcome(&self, id: &str) -> Option<Outcome> {
        self.outcomes.get(id).map(|entry| entry.value().clone())
    }

    /// Children still outstanding for an open container
    pub fn pending_children(&self, id: &str) -> Option<usize> {
        self.pending.get(id).map(|entry| entry.remaining)
    }
}
