use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::node::{Node, NodeId, NodeKind, NodeSpec, NodeTree, ResourceKey};
use crate::core::errors::StructuralError;
use crate::locks::{AccessMode, LockSet};

/// Turns discovered [`NodeSpec`]s into a frozen [`NodeTree`].
///
/// Validation happens in `build`: duplicate ids, dangling or shared child
/// references, cycles, unreachable nodes, unknown resource keys and
/// Shared→Exclusive escalations along a path are all rejected before
/// anything is scheduled.
#[derive(Debug)]
pub struct TreeBuilder {
    root: NodeId,
    specs: Vec<NodeSpec>,
    known_resources: Option<BTreeSet<ResourceKey>>,
}

impl TreeBuilder {
    pub fn new(root: impl Into<NodeId>) -> Self {
        Self {
            root: root.into(),
            specs: Vec::new(),
            known_resources: None,
        }
    }

    pub fn node(mut self, spec: NodeSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn nodes<I: IntoIterator<Item = NodeSpec>>(mut self, specs: I) -> Self {
        self.specs.extend(specs);
        self
    }

    /// Restrict resource keys to a known catalogue
    pub fn known_resources<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ResourceKey>,
    {
        self.known_resources = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Result<NodeTree, StructuralError> {
        let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(self.specs.len());
        for (i, spec) in self.specs.iter().enumerate() {
            if index.insert(spec.id.clone(), i).is_some() {
                return Err(StructuralError::DuplicateId {
                    node_id: spec.id.clone(),
                });
            }
            if spec.kind == NodeKind::Leaf && !spec.children.is_empty() {
                return Err(StructuralError::LeafWithChildren {
                    node_id: spec.id.clone(),
                });
            }
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(self.specs.len(), self.specs.len());
        let graph_nodes: Vec<NodeIndex> = (0..self.specs.len()).map(|i| graph.add_node(i)).collect();
        for (i, spec) in self.specs.iter().enumerate() {
            for child in &spec.children {
                let child_idx = index.get(child).ok_or_else(|| StructuralError::UnknownChild {
                    parent: spec.id.clone(),
                    child: child.clone(),
                })?;
                graph.add_edge(graph_nodes[i], graph_nodes[*child_idx], ());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let node_id = self.specs[graph[cycle.node_id()]].id.clone();
            return Err(StructuralError::Cycle { node_id });
        }

        let root_idx = *index.get(&self.root).ok_or_else(|| StructuralError::MissingRoot {
            root: self.root.clone(),
        })?;

        let mut parents: HashMap<usize, usize> = HashMap::new();
        for (i, spec) in self.specs.iter().enumerate() {
            for child in &spec.children {
                let child_idx = index[child];
                if let Some(first) = parents.insert(child_idx, i) {
                    return Err(StructuralError::MultipleParents {
                        child: child.clone(),
                        first: self.specs[first].id.clone(),
                        second: spec.id.clone(),
                    });
                }
            }
        }

        let mut reachable = vec![false; self.specs.len()];
        let mut stack = vec![root_idx];
        while let Some(i) = stack.pop() {
            reachable[i] = true;
            stack.extend(self.specs[i].children.iter().map(|c| index[c]));
        }
        if let Some(orphan) = reachable.iter().position(|seen| !seen) {
            return Err(StructuralError::Unreachable {
                node_id: self.specs[orphan].id.clone(),
                root: self.root.clone(),
            });
        }

        if let Some(known) = &self.known_resources {
            for spec in &self.specs {
                if let Some(req) = spec.requirements.iter().find(|r| !known.contains(&r.key)) {
                    return Err(StructuralError::UnknownResource {
                        node_id: spec.id.clone(),
                        key: req.key.clone(),
                    });
                }
            }
        }

        let mut specs: Vec<Option<NodeSpec>> = self.specs.into_iter().map(Some).collect();
        let root = freeze(root_idx, &mut specs, &index, &LockSet::new(), &BTreeMap::new())?;
        let tree = NodeTree::new(root);
        debug!(root = %tree.root().id(), nodes = tree.len(), "Node tree built");
        Ok(tree)
    }
}

/// Build the subtree at `idx` bottom-up, pushing inherited requirements down.
///
/// `owners` maps every inherited key to the nearest ancestor that declared it.
fn freeze(
    idx: usize,
    specs: &mut [Option<NodeSpec>],
    index: &HashMap<NodeId, usize>,
    inherited: &LockSet,
    owners: &BTreeMap<ResourceKey, NodeId>,
) -> Result<Arc<Node>, StructuralError> {
    // Each index is visited exactly once; the tree was checked above.
    let spec = match specs[idx].take() {
        Some(spec) => spec,
        None => {
            return Err(StructuralError::Cycle {
                node_id: index
                    .iter()
                    .find(|(_, i)| **i == idx)
                    .map(|(id, _)| id.clone())
                    .unwrap_or_default(),
            })
        }
    };

    let own: LockSet = spec.requirements.iter().cloned().collect();

    for (key, mode) in &own {
        if let Some(held) = inherited.get(key) {
            if !held.covers(*mode) {
                return Err(StructuralError::ModeConflict {
                    node_id: spec.id.clone(),
                    key: key.clone(),
                    ancestor: owners.get(key).cloned().unwrap_or_default(),
                    requested: *mode,
                    held,
                });
            }
        }
    }

    let effective = inherited.merged(&own);
    let mut child_owners = owners.clone();
    for (key, mode) in &own {
        // Only a declaration that strengthens (or introduces) the key takes ownership
        if inherited.get(key).map_or(true, |held| *mode > held) {
            child_owners.insert(key.clone(), spec.id.clone());
        }
    }

    let mut children = Vec::with_capacity(spec.children.len());
    let mut subtree = own.clone();
    for child in &spec.children {
        let frozen = freeze(index[child], specs, index, &effective, &child_owners)?;
        subtree.extend_from(&frozen.subtree_requirements);
        children.push(frozen);
    }

    Ok(Arc::new(Node {
        id: spec.id,
        kind: spec.kind,
        children,
        requirements: own,
        effective_requirements: effective,
        subtree_requirements: subtree,
        before_hooks: spec.before_hooks,
        after_hooks: spec.after_hooks,
        body: spec.body,
    }))
}
