//! Resource lock registry and the ordered lock sets it consumes

pub mod registry;
pub mod set;

pub use registry::{HeldLocks, LockRegistry};
pub use set::{AccessMode, LockSet, ResourceRequirement};
