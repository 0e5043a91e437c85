//! Execution of a built tree: contexts, scheduling, outcome roll-up and
//! the event stream consumers observe

pub mod aggregator;
pub mod context;
pub mod events;
pub mod outcome;
pub mod scheduler;

pub use aggregator::OutcomeAggregator;
pub use context::{CancellationHandle, ExecutionContext};
pub use events::{
    current_thread_label, BufferingEventSink, EventSink, EventStream, ExecutionEvent,
    ExecutionRecord, LoggingEventSink,
};
pub use outcome::{Outcome, SkipReason};
pub use scheduler::{RunHandle, RunReport, RunSummary, Scheduler, UnitState};
