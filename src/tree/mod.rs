//! Immutable description of containers and leaves, with inherited
//! resource requirements computed up front

pub mod builder;
pub mod node;

pub use builder::TreeBuilder;
pub use node::{Callable, Node, NodeId, NodeKind, NodeSpec, NodeTree, ResourceKey};
