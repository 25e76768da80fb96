//! Scoped variable dependency graph.
//!
//! Built once per dashboard configuration load from the expanded instance
//! set. Records which instances reference which, after resolving names
//! through the scope chain (same binding, then owning tab, then global),
//! and rejects cyclic configurations before any load proceeds.

pub mod cycle;
pub mod refs;

use crate::error::GraphError;
use crate::types::{IdentityKey, PanelTabMap, ScopeBinding, VariableInstance};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Parent/child edges for one instance.
#[derive(Debug, Clone, Default)]
pub struct DependencyNode {
    pub parents: Vec<IdentityKey>,
    pub children: Vec<IdentityKey>,
}

/// Directed dependency graph over variable instance keys.
#[derive(Debug, Default)]
pub struct ScopedDependencyGraph {
    nodes: HashMap<IdentityKey, DependencyNode>,
    /// Instance keys in insertion order, for deterministic traversal.
    order: Vec<IdentityKey>,
}

impl ScopedDependencyGraph {
    /// Build the graph from the expanded instance set.
    ///
    /// Reference resolution shadows lexically: a referenced name binds to
    /// the nearest instance in scope order (same binding, then the panel's
    /// owning tab, then global). Names with no matching instance are
    /// skipped; they may be built-in tokens outside the graph. A detected
    /// cycle is a fatal configuration error.
    pub fn build(
        instances: &[VariableInstance],
        panel_tabs: &PanelTabMap,
    ) -> Result<Self, GraphError> {
        let mut graph = ScopedDependencyGraph::default();
        for instance in instances {
            graph.order.push(instance.key.clone());
            graph.nodes.insert(instance.key.clone(), DependencyNode::default());
        }

        for instance in instances {
            for name in referenced_names(instance) {
                if let Some(parent_key) = graph.resolve_reference(&name, instance, panel_tabs) {
                    // A self-reference is the smallest possible cycle;
                    // recorded as-is and reported by detection below.
                    graph.add_edge(&parent_key, &instance.key);
                } else {
                    debug!(
                        child = %instance.key,
                        reference = %name,
                        "variable reference did not resolve to an instance, skipping"
                    );
                }
            }
        }

        if let Some(path) = cycle::find_cycle(&graph.order, &graph.children_index()) {
            return Err(GraphError::CyclicDependency { path });
        }

        Ok(graph)
    }

    /// Resolve `name` as seen from `child`, walking the scope chain.
    fn resolve_reference(
        &self,
        name: &str,
        child: &VariableInstance,
        panel_tabs: &PanelTabMap,
    ) -> Option<IdentityKey> {
        // (a) same scope and binding
        let same_scope = IdentityKey::new(name, &child.binding);
        if self.nodes.contains_key(&same_scope) {
            return Some(same_scope);
        }

        // (b) panel-scoped instances fall back to the panel's owning tab
        if let ScopeBinding::Panel { tab_id, panel_id } = &child.binding {
            let tab_id = panel_tabs
                .get(panel_id)
                .map(String::as_str)
                .unwrap_or(tab_id);
            let tab_key = IdentityKey::new(
                name,
                &ScopeBinding::Tab {
                    tab_id: tab_id.to_string(),
                },
            );
            if self.nodes.contains_key(&tab_key) {
                return Some(tab_key);
            }
        }

        // (c) global
        let global = IdentityKey::new(name, &ScopeBinding::Global);
        if self.nodes.contains_key(&global) {
            return Some(global);
        }

        None
    }

    fn add_edge(&mut self, parent: &IdentityKey, child: &IdentityKey) {
        if let Some(node) = self.nodes.get_mut(parent) {
            if !node.children.contains(child) {
                node.children.push(child.clone());
            }
        }
        if let Some(node) = self.nodes.get_mut(child) {
            if !node.parents.contains(parent) {
                node.parents.push(parent.clone());
            }
        }
    }

    fn children_index(&self) -> HashMap<IdentityKey, Vec<IdentityKey>> {
        self.nodes
            .iter()
            .map(|(key, node)| (key.clone(), node.children.clone()))
            .collect()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn parents_of(&self, key: &IdentityKey) -> &[IdentityKey] {
        self.nodes.get(key).map(|n| n.parents.as_slice()).unwrap_or(&[])
    }

    pub fn children_of(&self, key: &IdentityKey) -> &[IdentityKey] {
        self.nodes.get(key).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// All transitive descendants of `key`, each visited once.
    pub fn descendants_of(&self, key: &IdentityKey) -> Vec<IdentityKey> {
        let mut seen: HashSet<IdentityKey> = HashSet::new();
        let mut order: Vec<IdentityKey> = Vec::new();
        let mut frontier: Vec<IdentityKey> = self.children_of(key).to_vec();
        while let Some(next) = frontier.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            frontier.extend(self.children_of(&next).iter().cloned());
            order.push(next);
        }
        order
    }

    pub fn keys(&self) -> &[IdentityKey] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Names referenced by an instance's query filter text.
fn referenced_names(instance: &VariableInstance) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    if let Some(query) = &instance.query {
        for filter in &query.filters {
            for name in refs::extract_references(filter) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    names
}
