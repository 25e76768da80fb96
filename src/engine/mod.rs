//! Variable resolution engine.
//!
//! Drives visibility-gated, dependency-ordered loading of `query_values`
//! variables and propagates value changes to dependents. Loading is
//! event-driven: marking a tab or panel visible arms its instances, and
//! every resolution cascades to the children the graph names. Each node is
//! visited at most once per triggering event, so propagation is O(V+E).
//!
//! Consumers never observe implicit reactivity: state changes are published
//! on a broadcast channel and the per-instance status field stays the
//! single source of truth.

pub mod resolver;

use crate::config::DashvarConfig;
use crate::error::{EngineError, StoreError};
use crate::graph::ScopedDependencyGraph;
use crate::store::VariableStore;
use crate::types::{
    IdentityKey, ScopeBinding, VariableInstance, VariableKind, VariableStatus, VariableValue,
};
use resolver::{LoadTicket, OptionsResolver, ParentValues};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the readiness broadcast channel. Consumers re-check status
/// after every event, so a lagged receiver loses nothing.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Published whenever an instance's status or value changes.
#[derive(Debug, Clone)]
pub struct ReadinessEvent {
    pub key: IdentityKey,
    pub status: VariableStatus,
}

/// Scoped variable resolution engine.
pub struct VariableResolutionEngine {
    store: VariableStore,
    graph: ScopedDependencyGraph,
    options_resolver: Arc<dyn OptionsResolver>,
    /// Monotonic load generation per key; stale completions are discarded.
    generations: HashMap<IdentityKey, u64>,
    events: broadcast::Sender<ReadinessEvent>,
}

impl VariableResolutionEngine {
    /// Build the dependency graph over the store's instances and construct
    /// the engine. A cyclic configuration fails here, before any load.
    pub fn new(
        store: VariableStore,
        options_resolver: Arc<dyn OptionsResolver>,
    ) -> Result<Self, EngineError> {
        Self::with_event_capacity(store, options_resolver, EVENT_CHANNEL_CAPACITY)
    }

    /// [`Self::new`] tuned by [`DashvarConfig`].
    pub fn from_config(
        store: VariableStore,
        options_resolver: Arc<dyn OptionsResolver>,
        config: &DashvarConfig,
    ) -> Result<Self, EngineError> {
        Self::with_event_capacity(store, options_resolver, config.engine.event_channel_capacity)
    }

    /// [`Self::new`] with an explicit readiness channel capacity.
    pub fn with_event_capacity(
        store: VariableStore,
        options_resolver: Arc<dyn OptionsResolver>,
        capacity: usize,
    ) -> Result<Self, EngineError> {
        let graph = ScopedDependencyGraph::build(store.all_flat(), store.panel_tabs())?;
        let (events, _) = broadcast::channel(capacity.max(1));
        info!(instances = store.all_flat().len(), "resolution engine ready");
        Ok(Self {
            store,
            graph,
            options_resolver,
            generations: HashMap::new(),
            events,
        })
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut VariableStore {
        &mut self.store
    }

    pub fn graph(&self) -> &ScopedDependencyGraph {
        &self.graph
    }

    /// Subscribe to readiness events. The status field on the instance
    /// remains authoritative; events only say "something changed".
    pub fn subscribe(&self) -> broadcast::Receiver<ReadinessEvent> {
        self.events.subscribe()
    }

    fn emit(&self, key: &IdentityKey, status: VariableStatus) {
        let _ = self.events.send(ReadinessEvent {
            key: key.clone(),
            status,
        });
    }

    /// Whether an instance may issue a resolution request right now:
    /// visible, not already loading, every parent terminally loaded with a
    /// non-empty value. A parent that resolved to an empty value makes the
    /// child settle empty instead (no request).
    pub fn can_load(&self, key: &IdentityKey) -> bool {
        let Some(instance) = self.store.find_by_key(key) else {
            return false;
        };
        if !instance.visible || instance.status == VariableStatus::Loading {
            return false;
        }
        self.graph.parents_of(key).iter().all(|parent| {
            self.store
                .find_by_key(parent)
                .map(|p| p.is_resolved() && !p.value.is_empty())
                .unwrap_or(false)
        })
    }

    /// Every parent terminally loaded, at least one with an empty value:
    /// the no-data condition propagates downward without a request.
    fn parents_settled_empty(&self, key: &IdentityKey) -> bool {
        let parents = self.graph.parents_of(key);
        if parents.is_empty() {
            return false;
        }
        let all_resolved = parents.iter().all(|parent| {
            self.store
                .find_by_key(parent)
                .map(VariableInstance::is_resolved)
                .unwrap_or(false)
        });
        let any_empty = parents.iter().any(|parent| {
            self.store
                .find_by_key(parent)
                .map(|p| p.value.is_empty())
                .unwrap_or(false)
        });
        all_resolved && any_empty
    }

    /// Mark every global instance visible and arm unresolved ones.
    pub fn mark_dashboard_visible(&mut self) {
        self.mark_visible(|binding| *binding == ScopeBinding::Global);
    }

    pub fn mark_tab_visible(&mut self, tab_id: &str) {
        self.mark_visible(
            |binding| matches!(binding, ScopeBinding::Tab { tab_id: t } if t == tab_id),
        );
    }

    pub fn mark_panel_visible(&mut self, panel_id: &str) {
        self.mark_visible(
            |binding| matches!(binding, ScopeBinding::Panel { panel_id: p, .. } if p == panel_id),
        );
    }

    pub fn mark_tab_hidden(&mut self, tab_id: &str) {
        self.mark_hidden(
            |binding| matches!(binding, ScopeBinding::Tab { tab_id: t } if t == tab_id),
        );
    }

    pub fn mark_panel_hidden(&mut self, panel_id: &str) {
        self.mark_hidden(
            |binding| matches!(binding, ScopeBinding::Panel { panel_id: p, .. } if p == panel_id),
        );
    }

    fn mark_visible(&mut self, owned: impl Fn(&ScopeBinding) -> bool) {
        let keys: Vec<IdentityKey> = self
            .store
            .all_flat()
            .iter()
            .filter(|instance| owned(&instance.binding))
            .map(|instance| instance.key.clone())
            .collect();

        for key in keys {
            if let Some(instance) = self.store.find_by_key_mut(&key) {
                instance.visible = true;
            }
            self.arm(&key);
        }
    }

    fn mark_hidden(&mut self, owned: impl Fn(&ScopeBinding) -> bool) {
        let keys: Vec<IdentityKey> = self
            .store
            .all_flat()
            .iter()
            .filter(|instance| owned(&instance.binding))
            .map(|instance| instance.key.clone())
            .collect();

        for key in keys {
            if let Some(instance) = self.store.find_by_key_mut(&key) {
                instance.visible = false;
            }
        }
    }

    /// Move an unresolved `query_values` instance as far along the state
    /// machine as its parents allow.
    fn arm(&mut self, key: &IdentityKey) {
        let Some(instance) = self.store.find_by_key(key) else {
            return;
        };
        if instance.kind != VariableKind::QueryValues
            || instance.is_resolved()
            || instance.status == VariableStatus::Loading
            || !instance.visible
        {
            return;
        }

        if self.parents_settled_empty(key) {
            self.settle_empty_cascade(std::slice::from_ref(key));
        } else if self.can_load(key) {
            self.begin_load(key);
        } else if instance.status != VariableStatus::Pending {
            if let Some(instance) = self.store.find_by_key_mut(key) {
                instance.status = VariableStatus::Pending;
            }
            self.emit(key, VariableStatus::Pending);
        }
    }

    /// Transition to `Loading` under a fresh generation. The previous
    /// generation, if still in flight, is superseded from this moment.
    fn begin_load(&mut self, key: &IdentityKey) -> LoadTicket {
        let generation = {
            let slot = self.generations.entry(key.clone()).or_insert(0);
            *slot += 1;
            *slot
        };
        if let Some(instance) = self.store.find_by_key_mut(key) {
            instance.status = VariableStatus::Loading;
            instance.error = None;
        }
        debug!(key = %key, generation, "variable load started");
        self.emit(key, VariableStatus::Loading);
        LoadTicket {
            key: key.clone(),
            generation,
        }
    }

    /// Drive every `Loading` instance to completion, cascading to children
    /// as parents resolve, until no instance is left in `Loading`.
    ///
    /// Loads within one level run concurrently; levels proceed strictly in
    /// dependency order because a child only enters `Loading` once its
    /// parents resolved.
    pub async fn run_pending_loads(&mut self) {
        loop {
            let batch = self.snapshot_loading_batch();
            if batch.is_empty() {
                return;
            }

            let resolver = Arc::clone(&self.options_resolver);
            let futures = batch.into_iter().map(|(ticket, instance, parents)| {
                let resolver = Arc::clone(&resolver);
                async move {
                    let outcome = resolver.resolve(&instance, &parents).await;
                    (ticket, outcome)
                }
            });

            let results = futures::future::join_all(futures).await;
            for (ticket, outcome) in results {
                self.complete_load(ticket, outcome);
            }
        }
    }

    fn snapshot_loading_batch(
        &self,
    ) -> Vec<(LoadTicket, VariableInstance, ParentValues)> {
        self.store
            .all_flat()
            .iter()
            .filter(|instance| instance.status == VariableStatus::Loading)
            .map(|instance| {
                let generation = self
                    .generations
                    .get(&instance.key)
                    .copied()
                    .unwrap_or_default();
                let parents: ParentValues = self
                    .graph
                    .parents_of(&instance.key)
                    .iter()
                    .filter_map(|parent| self.store.find_by_key(parent))
                    .map(|parent| (parent.name.clone(), parent.value.deep_clone()))
                    .collect();
                (
                    LoadTicket {
                        key: instance.key.clone(),
                        generation,
                    },
                    instance.clone(),
                    parents,
                )
            })
            .collect()
    }

    /// Apply one load completion, unless a newer generation superseded it.
    pub fn complete_load(
        &mut self,
        ticket: LoadTicket,
        outcome: Result<Vec<crate::types::VariableOption>, EngineError>,
    ) {
        if self.generations.get(&ticket.key).copied().unwrap_or_default() != ticket.generation {
            debug!(key = %ticket.key, generation = ticket.generation, "stale load discarded");
            return;
        }
        let resolved = {
            let Some(instance) = self.store.find_by_key_mut(&ticket.key) else {
                return;
            };
            if instance.status != VariableStatus::Loading {
                return;
            }
            match outcome {
                Ok(options) => {
                    instance.apply_resolved_options(options);
                    true
                }
                Err(err) => {
                    // Isolated failure: siblings keep loading, descendants
                    // stay Pending.
                    warn!(key = %ticket.key, error = %err, "variable resolution failed");
                    instance.status = VariableStatus::Error;
                    instance.error = Some(err.to_string());
                    false
                }
            }
        };
        if resolved {
            self.emit(&ticket.key, VariableStatus::PartiallyLoaded);
            self.on_resolved(&ticket.key);
        } else {
            self.emit(&ticket.key, VariableStatus::Error);
        }
    }

    /// Cascade one resolution to the children the graph names. An empty
    /// resolved value force-settles the subtree without requests; a
    /// non-empty one arms each child whose own parents are now ready.
    fn on_resolved(&mut self, key: &IdentityKey) {
        let resolved_empty = self
            .store
            .find_by_key(key)
            .map(|instance| instance.value.is_empty())
            .unwrap_or(true);

        let children = self.graph.children_of(key).to_vec();
        if resolved_empty {
            self.settle_empty_cascade(&children);
        } else {
            for child in children {
                self.arm(&child);
            }
        }
    }

    /// Force-settle `roots` and their descendants to an empty
    /// `PartiallyLoaded` state: the upstream filter matched no data, so
    /// firing a request would be meaningless. Worklist traversal with one
    /// shared seen set; graphs can run to thousands of nodes, the relation
    /// is not a tree, and a join node must settle exactly once.
    fn settle_empty_cascade(&mut self, roots: &[IdentityKey]) {
        let mut seen: HashSet<IdentityKey> = HashSet::new();
        let mut worklist: Vec<IdentityKey> = roots.to_vec();
        while let Some(current) = worklist.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(instance) = self.store.find_by_key_mut(&current) {
                instance.options.clear();
                instance.value = VariableValue::List(Vec::new());
                instance.status = VariableStatus::PartiallyLoaded;
                instance.error = None;
            }
            debug!(key = %current, "settled empty, no-data condition propagated");
            self.emit(&current, VariableStatus::PartiallyLoaded);
            worklist.extend(self.graph.children_of(&current).iter().cloned());
        }
    }

    /// Apply a user-driven value change.
    ///
    /// All descendants reset to `Idle`/empty, but only the immediate
    /// children are re-armed now; deeper descendants wait for their own
    /// parent's resolution event. The result is a sequential, level-by-level
    /// reload along the dependency topology instead of a burst of
    /// simultaneous requests.
    pub fn on_value_changed(
        &mut self,
        key: &IdentityKey,
        new_value: VariableValue,
    ) -> Result<(), StoreError> {
        self.store.set_live_value(key, new_value)?;
        let status = self
            .store
            .find_by_key(key)
            .map(|instance| instance.status)
            .unwrap_or_default();
        self.emit(key, status);

        for descendant in self.graph.descendants_of(key) {
            let Some(instance) = self.store.find_by_key_mut(&descendant) else {
                continue;
            };
            if instance.kind != VariableKind::QueryValues || instance.immediately_resolvable() {
                continue;
            }
            instance.status = VariableStatus::Idle;
            instance.value = VariableValue::Null;
            instance.options.clear();
            instance.error = None;
            // Supersede any in-flight load for the descendant.
            *self.generations.entry(descendant.clone()).or_insert(0) += 1;
            self.emit(&descendant, VariableStatus::Idle);
        }

        let changed_to_empty = self
            .store
            .find_by_key(key)
            .map(|instance| instance.value.is_empty())
            .unwrap_or(true);

        let children = self.graph.children_of(key).to_vec();
        if changed_to_empty {
            self.settle_empty_cascade(&children);
        } else {
            for child in children {
                self.arm(&child);
            }
        }
        Ok(())
    }

    /// Readiness query for a panel: true when no referenced variable is
    /// still empty-valued in `Idle`/`Pending`/`Loading`. A resolved-empty
    /// variable counts as ready; names that resolve to no instance are
    /// built-in tokens and are ignored.
    pub fn panel_variables_ready(
        &self,
        panel_id: &str,
        tab_id: &str,
        referenced: &[String],
    ) -> bool {
        for name in referenced {
            let Some(instance) = self.resolve_for_panel(name, panel_id, tab_id) else {
                continue;
            };
            let in_flight = matches!(
                instance.status,
                VariableStatus::Idle | VariableStatus::Pending | VariableStatus::Loading
            );
            if in_flight && instance.value.is_empty() {
                return false;
            }
        }
        true
    }

    /// Aggregate readiness for dashboard-level consumers.
    pub fn is_all_variables_loaded(&self) -> bool {
        self.store.all_flat().iter().all(|instance| {
            !matches!(
                instance.status,
                VariableStatus::Pending | VariableStatus::Loading
            )
        })
    }

    /// Resolve `name` as the panel sees it: panel scope first, then the
    /// owning tab, then global.
    pub fn resolve_for_panel(
        &self,
        name: &str,
        panel_id: &str,
        tab_id: &str,
    ) -> Option<&VariableInstance> {
        let panel_key = IdentityKey::new(
            name,
            &ScopeBinding::Panel {
                tab_id: tab_id.to_string(),
                panel_id: panel_id.to_string(),
            },
        );
        if let Some(instance) = self.store.find_by_key(&panel_key) {
            return Some(instance);
        }
        let tab_key = IdentityKey::new(
            name,
            &ScopeBinding::Tab {
                tab_id: tab_id.to_string(),
            },
        );
        if let Some(instance) = self.store.find_by_key(&tab_key) {
            return Some(instance);
        }
        self.store.find_by_key(&IdentityKey::new(name, &ScopeBinding::Global))
    }
}
