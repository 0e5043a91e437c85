use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::exec::ExecutionContext;
use crate::locks::{LockSet, ResourceRequirement};

/// Identifier of a node, unique within one tree
pub type NodeId = String;

/// Identifier of a lockable resource
pub type ResourceKey = String;

/// Hook or test body. Runs on a blocking worker thread.
pub type Callable = Arc<dyn Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Container,
    Leaf,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Container => write!(f, "container"),
            NodeKind::Leaf => write!(f, "leaf"),
        }
    }
}

/// Raw description of one node as produced by discovery.
///
/// Children are referenced by id; [`TreeBuilder`](super::TreeBuilder)
/// resolves them and computes inherited requirements.
#[derive(Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    pub kind: NodeKind,
    pub children: Vec<NodeId>,
    pub requirements: Vec<ResourceRequirement>,
    pub before_hooks: Vec<Callable>,
    pub after_hooks: Vec<Callable>,
    pub body: Option<Callable>,
}

impl NodeSpec {
    pub fn container(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Container,
            children: Vec::new(),
            requirements: Vec::new(),
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            body: None,
        }
    }

    pub fn leaf<F>(id: impl Into<NodeId>, body: F) -> Self
    where
        F: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            kind: NodeKind::Leaf,
            children: Vec::new(),
            requirements: Vec::new(),
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            body: Some(Arc::new(body)),
        }
    }

    pub fn with_child(mut self, child: impl Into<NodeId>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }

    pub fn requires(mut self, requirement: ResourceRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn exclusive(self, key: impl Into<ResourceKey>) -> Self {
        self.requires(ResourceRequirement::exclusive(key))
    }

    pub fn shared(self, key: impl Into<ResourceKey>) -> Self {
        self.requires(ResourceRequirement::shared(key))
    }

    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.before_hooks.push(Arc::new(hook));
        self
    }

    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.after_hooks.push(Arc::new(hook));
        self
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("children", &self.children)
            .field("requirements", &self.requirements)
            .field("before_hooks", &self.before_hooks.len())
            .field("after_hooks", &self.after_hooks.len())
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Frozen node. Built once by the tree builder, never mutated afterwards.
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) children: Vec<Arc<Node>>,
    pub(crate) requirements: LockSet,
    pub(crate) effective_requirements: LockSet,
    pub(crate) subtree_requirements: LockSet,
    pub(crate) before_hooks: Vec<Callable>,
    pub(crate) after_hooks: Vec<Callable>,
    pub(crate) body: Option<Callable>,
}

impl Node {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn children(&self) -> &[Arc<Node>] {
        &self.children
    }

    /// Requirements declared directly on this node
    pub fn requirements(&self) -> &LockSet {
        &self.requirements
    }

    /// Own requirements merged with every ancestor's
    pub fn effective_requirements(&self) -> &LockSet {
        &self.effective_requirements
    }

    /// Own requirements merged with every descendant's
    pub fn subtree_requirements(&self) -> &LockSet {
        &self.subtree_requirements
    }

    pub fn before_hooks(&self) -> &[Callable] {
        &self.before_hooks
    }

    pub fn after_hooks(&self) -> &[Callable] {
        &self.after_hooks
    }

    pub fn body(&self) -> Option<&Callable> {
        self.body.as_ref()
    }

    /// Locks this node must hold before it runs.
    ///
    /// Empty when neither this node nor any ancestor declares anything.
    /// Otherwise everything the subtree declares is requested too, so a
    /// unit never has to take a second lock after it started running.
    pub fn lock_request(&self) -> LockSet {
        if self.effective_requirements.is_empty() {
            LockSet::new()
        } else {
            self.effective_requirements
                .merged(&self.subtree_requirements)
        }
    }

    /// Number of nodes in this subtree, including self
    pub fn subtree_len(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(|child| child.subtree_len())
            .sum::<usize>()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("requirements", &self.requirements)
            .field("effective_requirements", &self.effective_requirements)
            .field("children", &self.children)
            .finish()
    }
}

/// An immutable, acyclic node tree ready for scheduling
#[derive(Debug, Clone)]
pub struct NodeTree {
    root: Arc<Node>,
    len: usize,
}

impl NodeTree {
    pub(crate) fn new(root: Arc<Node>) -> Self {
        let len = root.subtree_len();
        Self { root, len }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Pre-order traversal
    pub fn iter(&self) -> Vec<&Arc<Node>> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    pub fn find(&self, id: &str) -> Option<&Arc<Node>> {
        self.iter().into_iter().find(|node| node.id == id)
    }

    pub fn leaf_ids(&self) -> Vec<NodeId> {
        self.iter()
            .into_iter()
            .filter(|node| node.is_leaf())
            .map(|node| node.id.clone())
            .collect()
    }
}
