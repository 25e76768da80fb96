//! URL query-parameter synchronization for variable values.
//!
//! Values serialize to `var-<name>` keys: `var-<name>` for global scope,
//! `var-<name>.t.<tabId>` for tab scope, `var-<name>.p.<panelId>` for panel
//! scope. Multi-select values serialize as repeated keys
//! (`var-x=a&var-x=b`); a legacy comma-joined single value is accepted on
//! read.

use crate::store::VariableStore;
use crate::types::{IdentityKey, ScopeBinding, VariableInstance, VariableValue};

const VAR_PREFIX: &str = "var-";
const TAB_MARKER: &str = ".t.";
const PANEL_MARKER: &str = ".p.";

/// Scope addressed by one URL key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlScope {
    Global,
    Tab(String),
    Panel(String),
}

/// Query-string key for one instance.
pub fn url_key(instance: &VariableInstance) -> String {
    match &instance.binding {
        ScopeBinding::Global => format!("{}{}", VAR_PREFIX, instance.name),
        ScopeBinding::Tab { tab_id } => {
            format!("{}{}{}{}", VAR_PREFIX, instance.name, TAB_MARKER, tab_id)
        }
        ScopeBinding::Panel { panel_id, .. } => {
            format!("{}{}{}{}", VAR_PREFIX, instance.name, PANEL_MARKER, panel_id)
        }
    }
}

/// Parse a query-string key back into a variable name and scope.
/// Returns `None` for keys without the `var-` prefix.
pub fn parse_url_key(key: &str) -> Option<(String, UrlScope)> {
    let rest = key.strip_prefix(VAR_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    if let Some(idx) = rest.rfind(TAB_MARKER) {
        let (name, tab_id) = (&rest[..idx], &rest[idx + TAB_MARKER.len()..]);
        if !name.is_empty() && !tab_id.is_empty() {
            return Some((name.to_string(), UrlScope::Tab(tab_id.to_string())));
        }
    }
    if let Some(idx) = rest.rfind(PANEL_MARKER) {
        let (name, panel_id) = (&rest[..idx], &rest[idx + PANEL_MARKER.len()..]);
        if !name.is_empty() && !panel_id.is_empty() {
            return Some((name.to_string(), UrlScope::Panel(panel_id.to_string())));
        }
    }
    Some((rest.to_string(), UrlScope::Global))
}

/// Serialize one instance's value: one pair per selected value, so
/// multi-select values round-trip as repeated keys. A null value yields
/// nothing.
pub fn format_value_for_url(instance: &VariableInstance) -> Vec<(String, String)> {
    let key = url_key(instance);
    match &instance.value {
        VariableValue::Null => Vec::new(),
        VariableValue::Scalar(value) => vec![(key, value.clone())],
        VariableValue::List(values) => values
            .iter()
            .map(|value| (key.clone(), value.clone()))
            .collect(),
    }
}

/// Serialize every live instance with a non-null value.
pub fn serialize_store(store: &VariableStore) -> Vec<(String, String)> {
    store
        .all_flat()
        .iter()
        .flat_map(format_value_for_url)
        .collect()
}

/// Recover a value from the raw occurrences of one key.
///
/// Repeated keys always win; a single comma-joined occurrence for a
/// multi-select variable is the legacy fallback form.
pub fn parse_value(raw: &[String], multi_select: bool) -> VariableValue {
    if raw.is_empty() {
        return VariableValue::Null;
    }
    if multi_select {
        if raw.len() == 1 && raw[0].contains(',') {
            return VariableValue::List(raw[0].split(',').map(str::to_string).collect());
        }
        return VariableValue::List(raw.to_vec());
    }
    VariableValue::Scalar(raw[0].clone())
}

/// Apply URL query parameters to live store state.
///
/// A global key with no matching global instance is broadcast to every
/// tab/panel instance sharing that name (drilldown-link compatibility).
pub fn apply_url_params(store: &mut VariableStore, params: &[(String, String)]) {
    // Group repeated occurrences per key, preserving first-seen order.
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in params {
        match grouped.iter_mut().find(|(k, _)| k == key) {
            Some((_, values)) => values.push(value.clone()),
            None => grouped.push((key.clone(), vec![value.clone()])),
        }
    }

    for (key, raw) in grouped {
        let Some((name, scope)) = parse_url_key(&key) else {
            continue;
        };

        let targets: Vec<IdentityKey> = match scope {
            UrlScope::Tab(tab_id) => store
                .all_flat()
                .iter()
                .filter(|i| {
                    i.name == name
                        && matches!(&i.binding, ScopeBinding::Tab { tab_id: t } if *t == tab_id)
                })
                .map(|i| i.key.clone())
                .collect(),
            UrlScope::Panel(panel_id) => store
                .all_flat()
                .iter()
                .filter(|i| {
                    i.name == name
                        && matches!(&i.binding, ScopeBinding::Panel { panel_id: p, .. } if *p == panel_id)
                })
                .map(|i| i.key.clone())
                .collect(),
            UrlScope::Global => {
                let global_key = IdentityKey::new(&name, &ScopeBinding::Global);
                if store.find_by_key(&global_key).is_some() {
                    vec![global_key]
                } else {
                    // Broadcast to every same-named scoped instance.
                    store
                        .all_flat()
                        .iter()
                        .filter(|i| i.name == name)
                        .map(|i| i.key.clone())
                        .collect()
                }
            }
        };

        for target in targets {
            let multi_select = store
                .find_by_key(&target)
                .map(|i| i.multi_select)
                .unwrap_or(false);
            let value = parse_value(&raw, multi_select);
            let _ = store.set_live_value(&target, value);
        }
    }
}
