//! Scoped variable store.
//!
//! Holds the expanded collection of variable instances in two parallel
//! copies: "live" mutates immediately on user interaction, "committed" is a
//! deep-cloned checkpoint taken on an explicit commit. Panels execute
//! queries against committed state; UI controls read and write live state.

pub mod url_sync;

use crate::error::StoreError;
use crate::types::{
    DefinitionScope, IdentityKey, PanelTabMap, ScopeBinding, VariableDefinition, VariableInstance,
    VariableValue,
};
use tracing::debug;

/// Live and committed scoped variable collections.
#[derive(Debug)]
pub struct VariableStore {
    live: Vec<VariableInstance>,
    committed: Vec<VariableInstance>,
    panel_tabs: PanelTabMap,
}

impl VariableStore {
    /// Expand definitions into instances and take the initial committed
    /// checkpoint.
    ///
    /// A `tabs`-scoped definition expands into one instance per listed tab;
    /// `panels` expands per listed panel; `global` (including a missing
    /// scope, for backward compatibility) yields exactly one instance.
    pub fn from_definitions(
        definitions: &[VariableDefinition],
        panel_tabs: PanelTabMap,
    ) -> Result<Self, StoreError> {
        let mut live: Vec<VariableInstance> = Vec::new();

        for definition in definitions {
            let bindings: Vec<ScopeBinding> = match definition.scope {
                DefinitionScope::Global => vec![ScopeBinding::Global],
                DefinitionScope::Tabs => definition
                    .tabs
                    .iter()
                    .map(|tab_id| ScopeBinding::Tab {
                        tab_id: tab_id.clone(),
                    })
                    .collect(),
                DefinitionScope::Panels => definition
                    .panels
                    .iter()
                    .map(|panel_id| ScopeBinding::Panel {
                        tab_id: panel_tabs.get(panel_id).cloned().unwrap_or_default(),
                        panel_id: panel_id.clone(),
                    })
                    .collect(),
            };

            for binding in bindings {
                let instance = VariableInstance::from_definition(definition, binding);
                if live.iter().any(|existing| existing.key == instance.key) {
                    return Err(StoreError::DuplicateInstance(instance.key));
                }
                debug!(key = %instance.key, kind = ?instance.kind, "expanded variable instance");
                live.push(instance);
            }
        }

        let committed = live.iter().map(deep_copy).collect();
        Ok(Self {
            live,
            committed,
            panel_tabs,
        })
    }

    pub fn panel_tabs(&self) -> &PanelTabMap {
        &self.panel_tabs
    }

    /// Live instances, in expansion order.
    pub fn all_flat(&self) -> &[VariableInstance] {
        &self.live
    }

    pub fn find_by_key(&self, key: &IdentityKey) -> Option<&VariableInstance> {
        self.live.iter().find(|instance| &instance.key == key)
    }

    pub fn find_by_key_mut(&mut self, key: &IdentityKey) -> Option<&mut VariableInstance> {
        self.live.iter_mut().find(|instance| &instance.key == key)
    }

    pub fn get(&self, name: &str, binding: &ScopeBinding) -> Option<&VariableInstance> {
        self.find_by_key(&IdentityKey::new(name, binding))
    }

    /// Live instances visible to a panel: global first, then the owning
    /// tab's, then the panel's own. Later entries shadow earlier same-named
    /// entries in lookups, but all are included for query substitution.
    pub fn instances_for_panel(&self, panel_id: &str, tab_id: &str) -> Vec<&VariableInstance> {
        merged_for_panel(&self.live, panel_id, tab_id)
    }

    /// Committed counterpart of [`Self::instances_for_panel`]; this is the
    /// view queries execute against.
    pub fn committed_for_panel(&self, panel_id: &str, tab_id: &str) -> Vec<&VariableInstance> {
        merged_for_panel(&self.committed, panel_id, tab_id)
    }

    pub fn committed_find_by_key(&self, key: &IdentityKey) -> Option<&VariableInstance> {
        self.committed.iter().find(|instance| &instance.key == key)
    }

    /// Deep-copy every live instance into the committed snapshot.
    pub fn commit_all(&mut self) {
        self.committed = self.live.iter().map(deep_copy).collect();
        debug!(count = self.committed.len(), "committed all variable scopes");
    }

    /// Deep-copy the instances a single panel reads (global, owning tab,
    /// panel-scoped) into the committed snapshot, leaving the rest of the
    /// committed state untouched.
    pub fn commit_panel(&mut self, panel_id: &str) {
        let tab_id = self.panel_tabs.get(panel_id).cloned().unwrap_or_default();
        let keys: Vec<IdentityKey> = self
            .instances_for_panel(panel_id, &tab_id)
            .iter()
            .map(|instance| instance.key.clone())
            .collect();

        for key in keys {
            let Some(source) = self.live.iter().find(|i| i.key == key) else {
                continue;
            };
            let copy = deep_copy(source);
            match self.committed.iter_mut().find(|i| i.key == key) {
                Some(slot) => *slot = copy,
                None => self.committed.push(copy),
            }
        }
        debug!(panel_id = %panel_id, "committed panel variable scope");
    }

    /// Whether any live value differs from its committed counterpart.
    /// List values are compared by content, not identity.
    pub fn has_uncommitted_changes(&self) -> bool {
        for live in &self.live {
            match self.committed.iter().find(|i| i.key == live.key) {
                Some(committed) => {
                    if committed.name != live.name || committed.value != live.value {
                        return true;
                    }
                }
                None => return true,
            }
        }
        false
    }

    pub fn set_live_value(
        &mut self,
        key: &IdentityKey,
        value: VariableValue,
    ) -> Result<(), StoreError> {
        let instance = self
            .find_by_key_mut(key)
            .ok_or_else(|| StoreError::InstanceNotFound(key.clone()))?;
        instance.value = value;
        Ok(())
    }
}

fn merged_for_panel<'a>(
    source: &'a [VariableInstance],
    panel_id: &str,
    tab_id: &str,
) -> Vec<&'a VariableInstance> {
    let mut merged: Vec<&VariableInstance> = Vec::new();
    merged.extend(source.iter().filter(|i| i.binding == ScopeBinding::Global));
    merged.extend(
        source
            .iter()
            .filter(|i| matches!(&i.binding, ScopeBinding::Tab { tab_id: t } if t == tab_id)),
    );
    merged.extend(source.iter().filter(
        |i| matches!(&i.binding, ScopeBinding::Panel { panel_id: p, .. } if p == panel_id),
    ));
    merged
}

/// Commit-time copy: independent of reference identity, so a later live
/// mutation can never retroactively change an already-committed panel run.
fn deep_copy(instance: &VariableInstance) -> VariableInstance {
    let mut copy = instance.clone();
    copy.value = instance.value.deep_clone();
    copy
}
