//! Live/committed snapshot semantics across scopes.

use super::test_utils::{constant_var, query_var};
use dashvar::store::VariableStore;
use dashvar::types::{
    DefinitionScope, IdentityKey, PanelTabMap, ScopeBinding, VariableValue,
};

fn global_key(name: &str) -> IdentityKey {
    IdentityKey::new(name, &ScopeBinding::Global)
}

fn panel_tabs() -> PanelTabMap {
    let mut map = PanelTabMap::new();
    map.insert("panel-1".to_string(), "tab-1".to_string());
    map.insert("panel-2".to_string(), "tab-1".to_string());
    map
}

/// Committing a panel only snapshots the instances that panel sees.
#[test]
fn test_commit_panel_scopes_the_snapshot() {
    let global = constant_var("env", "prod");
    let mut per_panel = query_var("threshold", &[]);
    per_panel.scope = DefinitionScope::Panels;
    per_panel.panels = vec!["panel-1".to_string(), "panel-2".to_string()];

    let mut store = VariableStore::from_definitions(&[global, per_panel], panel_tabs()).unwrap();

    let key_p1 = IdentityKey::new(
        "threshold",
        &ScopeBinding::Panel {
            tab_id: "tab-1".to_string(),
            panel_id: "panel-1".to_string(),
        },
    );
    let key_p2 = IdentityKey::new(
        "threshold",
        &ScopeBinding::Panel {
            tab_id: "tab-1".to_string(),
            panel_id: "panel-2".to_string(),
        },
    );
    store
        .set_live_value(&key_p1, VariableValue::Scalar("10".to_string()))
        .unwrap();
    store
        .set_live_value(&key_p2, VariableValue::Scalar("20".to_string()))
        .unwrap();

    store.commit_panel("panel-1");

    assert_eq!(
        store.committed_find_by_key(&key_p1).unwrap().value,
        VariableValue::Scalar("10".to_string())
    );
    // panel-2's live edit is not part of panel-1's commit.
    assert_ne!(
        store.committed_find_by_key(&key_p2).map(|i| i.value.clone()),
        Some(VariableValue::Scalar("20".to_string()))
    );
}

/// Committed snapshots are deep copies: later live edits never leak in.
#[test]
fn test_commit_is_deep_and_non_aliasing() {
    let mut store =
        VariableStore::from_definitions(&[query_var("host", &[])], PanelTabMap::new()).unwrap();

    store
        .set_live_value(
            &global_key("host"),
            VariableValue::List(vec!["h1".to_string(), "h2".to_string()]),
        )
        .unwrap();
    store.commit_all();
    assert!(!store.has_uncommitted_changes());

    store
        .set_live_value(&global_key("host"), VariableValue::Scalar("h3".to_string()))
        .unwrap();

    assert!(store.has_uncommitted_changes());
    assert_eq!(
        store.committed_find_by_key(&global_key("host")).unwrap().value,
        VariableValue::List(vec!["h1".to_string(), "h2".to_string()])
    );
}

/// Commit is idempotent when nothing changed.
#[test]
fn test_commit_idempotent_without_changes() {
    let mut store =
        VariableStore::from_definitions(&[query_var("host", &[])], PanelTabMap::new()).unwrap();
    store.commit_all();
    assert!(!store.has_uncommitted_changes());
    store.commit_all();
    assert!(!store.has_uncommitted_changes());
}
