// Ambient infrastructure shared by the tree, locks and scheduler

pub mod config;
pub mod errors;
pub mod telemetry;

// Re-export commonly used types
pub use config::{SchedulerConfig, SchedulerConfigBuilder};
pub use errors::{HookPhase, NodeError, Result, SchedulerError, StructuralError};
pub use telemetry::{init_tracing, try_init_tracing};
