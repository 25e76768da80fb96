//! End-to-end resolution flows through the engine's public API.

use super::test_utils::{options, query_var, StaticResolver};
use dashvar::engine::VariableResolutionEngine;
use dashvar::store::VariableStore;
use dashvar::types::{
    DefinitionScope, IdentityKey, PanelTabMap, ScopeBinding, VariableStatus, VariableValue,
};
use std::collections::HashMap;
use std::sync::Arc;

fn global_key(name: &str) -> IdentityKey {
    IdentityKey::new(name, &ScopeBinding::Global)
}

fn tab_key(name: &str, tab_id: &str) -> IdentityKey {
    IdentityKey::new(
        name,
        &ScopeBinding::Tab {
            tab_id: tab_id.to_string(),
        },
    )
}

/// A tab-scoped variable stays idle until its tab becomes visible.
#[tokio::test]
async fn test_tab_visibility_gates_loading() {
    let mut definition = query_var("namespace", &[]);
    definition.scope = DefinitionScope::Tabs;
    definition.tabs = vec!["tab-1".to_string(), "tab-2".to_string()];

    let mut table = HashMap::new();
    table.insert("namespace".to_string(), options(&["default", "kube"]));
    let resolver = Arc::new(StaticResolver::new(table));

    let store = VariableStore::from_definitions(&[definition], PanelTabMap::new()).unwrap();
    let mut engine = VariableResolutionEngine::new(store, resolver.clone()).unwrap();

    engine.mark_dashboard_visible();
    engine.run_pending_loads().await;
    assert!(resolver.calls().is_empty(), "hidden tab must not load");

    engine.mark_tab_visible("tab-1");
    engine.run_pending_loads().await;

    assert_eq!(resolver.calls(), vec!["namespace".to_string()]);
    let visible = engine.store().find_by_key(&tab_key("namespace", "tab-1")).unwrap();
    assert_eq!(visible.status, VariableStatus::PartiallyLoaded);
    let hidden = engine.store().find_by_key(&tab_key("namespace", "tab-2")).unwrap();
    assert_eq!(hidden.status, VariableStatus::Idle);
}

/// A reference from a tab-scoped variable binds to the same-named tab
/// instance, shadowing the global one.
#[tokio::test]
async fn test_reference_binds_to_nearest_scope() {
    let region_global = query_var("region", &[]);
    let mut host_tab = query_var("host", &["region = '$region'"]);
    host_tab.scope = DefinitionScope::Tabs;
    host_tab.tabs = vec!["tab-1".to_string()];
    let mut region_tab = query_var("region", &[]);
    region_tab.scope = DefinitionScope::Tabs;
    region_tab.tabs = vec!["tab-1".to_string()];

    let mut table = HashMap::new();
    table.insert("region".to_string(), options(&["us-east"]));
    table.insert("host".to_string(), options(&["h1"]));
    let resolver = Arc::new(StaticResolver::new(table));

    let store = VariableStore::from_definitions(
        &[region_global, region_tab, host_tab],
        PanelTabMap::new(),
    )
    .unwrap();
    let engine = VariableResolutionEngine::new(store, resolver).unwrap();

    let parents = engine.graph().parents_of(&tab_key("host", "tab-1"));
    assert_eq!(parents, &[tab_key("region", "tab-1")]);

    // The panel view resolves through the same precedence.
    let seen = engine.resolve_for_panel("region", "panel-9", "tab-1").unwrap();
    assert_eq!(seen.key, tab_key("region", "tab-1"));
}

/// A parent that resolves to no data settles its whole subtree without a
/// single downstream request.
#[tokio::test]
async fn test_empty_parent_settles_descendants_without_requests() {
    let mut table = HashMap::new();
    table.insert("region".to_string(), Vec::new());
    table.insert("host".to_string(), options(&["h1"]));
    table.insert("disk".to_string(), options(&["d1"]));
    let resolver = Arc::new(StaticResolver::new(table));

    let store = VariableStore::from_definitions(
        &[
            query_var("region", &[]),
            query_var("host", &["region = '$region'"]),
            query_var("disk", &["host = '$host'"]),
        ],
        PanelTabMap::new(),
    )
    .unwrap();
    let mut engine = VariableResolutionEngine::new(store, resolver.clone()).unwrap();

    engine.mark_dashboard_visible();
    engine.run_pending_loads().await;

    // Only the root issued a request.
    assert_eq!(resolver.calls(), vec!["region".to_string()]);
    for name in ["host", "disk"] {
        let instance = engine.store().find_by_key(&global_key(name)).unwrap();
        assert_eq!(instance.status, VariableStatus::PartiallyLoaded);
        assert_eq!(instance.value, VariableValue::List(Vec::new()));
        assert!(instance.value.is_empty());
    }
    // The panel readiness gate treats the settled subtree as ready.
    assert!(engine.panel_variables_ready(
        "panel-1",
        "tab-1",
        &["region".to_string(), "disk".to_string()]
    ));
}

/// A failing parent leaves its descendants pending and its siblings
/// untouched.
#[tokio::test]
async fn test_failed_parent_isolates_its_subtree() {
    let mut table = HashMap::new();
    table.insert("other".to_string(), options(&["x"]));
    table.insert("host".to_string(), options(&["h1"]));
    let resolver = Arc::new(
        StaticResolver::new(table).failing("region"),
    );

    let store = VariableStore::from_definitions(
        &[
            query_var("region", &[]),
            query_var("host", &["region = '$region'"]),
            query_var("other", &[]),
        ],
        PanelTabMap::new(),
    )
    .unwrap();
    let mut engine = VariableResolutionEngine::new(store, resolver).unwrap();

    engine.mark_dashboard_visible();
    engine.run_pending_loads().await;

    let region = engine.store().find_by_key(&global_key("region")).unwrap();
    assert_eq!(region.status, VariableStatus::Error);
    assert!(region.error.is_some());

    let host = engine.store().find_by_key(&global_key("host")).unwrap();
    assert_eq!(host.status, VariableStatus::Pending);

    let other = engine.store().find_by_key(&global_key("other")).unwrap();
    assert_eq!(other.status, VariableStatus::PartiallyLoaded);

    // A pending empty-valued dependency blocks panel readiness.
    assert!(!engine.panel_variables_ready("panel-1", "tab-1", &["host".to_string()]));
}

/// Changing a value mid-flight supersedes the in-flight load; the engine
/// converges on the new value's cascade.
#[tokio::test]
async fn test_value_change_supersedes_in_flight_load() {
    let mut table = HashMap::new();
    table.insert("region".to_string(), options(&["us-east", "eu-west"]));
    table.insert("host".to_string(), options(&["h1", "h2"]));
    let resolver = Arc::new(StaticResolver::new(table));

    let store = VariableStore::from_definitions(
        &[
            query_var("region", &[]),
            query_var("host", &["region = '$region'"]),
        ],
        PanelTabMap::new(),
    )
    .unwrap();
    let mut engine = VariableResolutionEngine::new(store, resolver).unwrap();

    engine.mark_dashboard_visible();
    engine.run_pending_loads().await;

    // First change re-arms host, second change lands while the first
    // reload is conceptually in flight; only the newest generation wins.
    engine
        .on_value_changed(&global_key("region"), VariableValue::Scalar("eu-west".into()))
        .unwrap();
    engine
        .on_value_changed(&global_key("region"), VariableValue::Scalar("us-east".into()))
        .unwrap();
    engine.run_pending_loads().await;

    let host = engine.store().find_by_key(&global_key("host")).unwrap();
    assert_eq!(host.status, VariableStatus::PartiallyLoaded);
    assert_eq!(host.value, VariableValue::Scalar("h1".to_string()));
    assert!(engine.is_all_variables_loaded());
}
