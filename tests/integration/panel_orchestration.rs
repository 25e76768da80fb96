//! Panel load orchestration end-to-end: gates, streaming, cancellation,
//! and the warm-start cache.

use super::test_utils::{constant_var, query_var, options, ScriptedResponse, ScriptedTransport, StaticResolver};
use dashvar::cache::{PanelCacheStore, SledPanelCacheStore};
use dashvar::config::DashvarConfig;
use dashvar::engine::VariableResolutionEngine;
use dashvar::panel::{PanelLoadOrchestrator, PanelQuery, PanelSchema, RunPhase};
use dashvar::store::VariableStore;
use dashvar::types::{PanelTabMap, TimeRange, VariableDefinition};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn schema(queries: Vec<PanelQuery>) -> PanelSchema {
    PanelSchema {
        panel_id: "panel-1".to_string(),
        tab_id: "tab-1".to_string(),
        queries,
        width_px: 800,
        timestamp_column: "_timestamp".to_string(),
        raw: json!({"id": "panel-1", "type": "line", "layout": {"x": 0}}),
    }
}

fn one_query(text: &str) -> Vec<PanelQuery> {
    vec![PanelQuery {
        query: text.to_string(),
        time_shifts: vec![],
    }]
}

fn engine_with(definitions: &[VariableDefinition]) -> Arc<RwLock<VariableResolutionEngine>> {
    let mut panel_tabs = PanelTabMap::new();
    panel_tabs.insert("panel-1".to_string(), "tab-1".to_string());
    let store = VariableStore::from_definitions(definitions, panel_tabs).unwrap();
    let resolver = Arc::new(StaticResolver::new(HashMap::new()));
    Arc::new(RwLock::new(
        VariableResolutionEngine::new(store, resolver).unwrap(),
    ))
}

fn orchestrator(
    schema: PanelSchema,
    engine: Arc<RwLock<VariableResolutionEngine>>,
    transport: Arc<ScriptedTransport>,
    cache: Arc<dyn PanelCacheStore>,
) -> PanelLoadOrchestrator {
    PanelLoadOrchestrator::new(schema, "folder-1", "dash-1", "org-1", engine, transport, cache)
        .with_debounce(Duration::from_millis(1))
}

fn range() -> TimeRange {
    TimeRange::new(1_700_000_000_000_000, 1_700_000_900_000_000)
}

fn sled_cache(dir: &TempDir) -> Arc<dyn PanelCacheStore> {
    Arc::new(SledPanelCacheStore::open(dir.path()).unwrap())
}

/// A visible panel with no variable references streams hits to completion.
#[tokio::test]
async fn test_load_streams_hits_and_completes() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::with_scripts(vec![ScriptedResponse::ok(
        vec![json!({"v": 1}), json!({"v": 2})],
    )]));
    let orchestrator = orchestrator(
        schema(one_query("SELECT v FROM logs")),
        engine_with(&[]),
        transport.clone(),
        sled_cache(&dir),
    );

    orchestrator.set_visible(true);
    orchestrator.load_data(range(), false).await;

    let state = orchestrator.state();
    assert_eq!(state.phase, RunPhase::Completed);
    assert!(!state.loading);
    assert_eq!(state.progress, 100);
    assert!(!state.is_partial_data);
    assert!(!state.is_operation_cancelled);
    assert_eq!(state.data.len(), 1);
    assert_eq!(state.data[0].len(), 2);
    assert_eq!(transport.requests().len(), 1);
}

/// Variable tokens in the query are substituted from committed state.
#[tokio::test]
async fn test_committed_variables_substituted_into_query() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::with_scripts(vec![ScriptedResponse::ok(
        vec![],
    )]));
    let orchestrator = orchestrator(
        schema(one_query("SELECT v FROM logs WHERE env = '$env'")),
        engine_with(&[constant_var("env", "prod")]),
        transport.clone(),
        sled_cache(&dir),
    );

    orchestrator.set_visible(true);
    orchestrator.load_data(range(), false).await;

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].query, "SELECT v FROM logs WHERE env = 'prod'");
}

/// The run blocks on an unresolved referenced variable and proceeds once
/// the engine resolves it.
#[tokio::test]
async fn test_run_waits_for_variable_readiness() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::with_scripts(vec![ScriptedResponse::ok(
        vec![json!({"v": 1})],
    )]));

    let mut panel_tabs = PanelTabMap::new();
    panel_tabs.insert("panel-1".to_string(), "tab-1".to_string());
    let store =
        VariableStore::from_definitions(&[query_var("region", &[])], panel_tabs).unwrap();
    let mut table = HashMap::new();
    table.insert("region".to_string(), options(&["us-east"]));
    let resolver = Arc::new(StaticResolver::new(table));
    let engine = Arc::new(RwLock::new(
        VariableResolutionEngine::new(store, resolver).unwrap(),
    ));

    let orchestrator = Arc::new(orchestrator(
        schema(one_query("SELECT v FROM logs WHERE region = '$region'")),
        engine.clone(),
        transport.clone(),
        sled_cache(&dir),
    ));
    orchestrator.set_visible(true);

    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.load_data(range(), false).await })
    };

    // Give the run time to pass debounce and reach the readiness gate.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.requests().is_empty(), "gate must hold the run");
    assert_eq!(orchestrator.state().phase, RunPhase::WaitingVariables);

    {
        let mut engine = engine.write();
        engine.mark_dashboard_visible();
        engine.run_pending_loads().await;
    }

    run.await.unwrap();
    let state = orchestrator.state();
    assert_eq!(state.phase, RunPhase::Completed);
    assert_eq!(transport.requests().len(), 1);
    assert!(transport.requests()[0].query.contains("region = 'us-east'"));
}

/// Cancelling mid-flight marks the partial/cancelled flags and cancels the
/// tracked request; a later successful run resets both flags.
#[tokio::test]
async fn test_cancel_mid_flight_then_success_resets_flags() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::with_scripts(vec![
        ScriptedResponse::ok(vec![json!({"v": 1})]).slow(Duration::from_secs(5)),
        ScriptedResponse::ok(vec![json!({"v": 2})]),
    ]));
    let orchestrator = Arc::new(orchestrator(
        schema(one_query("SELECT v FROM logs")),
        engine_with(&[]),
        transport.clone(),
        sled_cache(&dir),
    ));
    orchestrator.set_visible(true);

    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.load_data(range(), false).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(orchestrator.state().loading);

    orchestrator.cancel();
    run.await.unwrap();

    let cancelled = orchestrator.state();
    assert_eq!(cancelled.phase, RunPhase::Cancelled);
    assert!(cancelled.is_partial_data);
    assert!(cancelled.is_operation_cancelled);
    assert!(!cancelled.loading);
    assert_eq!(transport.cancelled().len(), 1);

    orchestrator.load_data(range(), false).await;
    let done = orchestrator.state();
    assert_eq!(done.phase, RunPhase::Completed);
    assert!(!done.is_partial_data);
    assert!(!done.is_operation_cancelled);
}

/// A fresh orchestrator restores the previous session's snapshot from the
/// cache without touching the network.
#[tokio::test]
async fn test_first_run_restores_from_cache() {
    let dir = TempDir::new().unwrap();
    let cache = sled_cache(&dir);

    let warm_transport = Arc::new(ScriptedTransport::with_scripts(vec![ScriptedResponse::ok(
        vec![json!({"v": 1})],
    )]));
    let first = orchestrator(
        schema(one_query("SELECT v FROM logs")),
        engine_with(&[]),
        warm_transport,
        cache.clone(),
    );
    first.set_visible(true);
    first.load_data(range(), false).await;
    assert_eq!(first.state().phase, RunPhase::Completed);

    // Same panel, same schema, no scripted responses: any request would
    // leave the state empty-handed.
    let cold_transport = Arc::new(ScriptedTransport::default());
    let second = orchestrator(
        schema(one_query("SELECT v FROM logs")),
        engine_with(&[]),
        cold_transport.clone(),
        cache,
    );
    second.set_visible(true);
    second.load_data(range(), false).await;

    let state = second.state();
    assert_eq!(state.phase, RunPhase::Completed);
    assert_eq!(state.data.len(), 1);
    assert_eq!(state.data[0].len(), 1);
    assert!(!state.is_cached_data_differ_with_current_time_range);
    assert!(cold_transport.requests().is_empty());
}

/// A cache hit for a different time window is kept but flagged.
#[tokio::test]
async fn test_cache_hit_flags_differing_time_range() {
    let dir = TempDir::new().unwrap();
    let cache = sled_cache(&dir);

    let warm_transport = Arc::new(ScriptedTransport::with_scripts(vec![ScriptedResponse::ok(
        vec![json!({"v": 1})],
    )]));
    let first = orchestrator(
        schema(one_query("SELECT v FROM logs")),
        engine_with(&[]),
        warm_transport,
        cache.clone(),
    );
    first.set_visible(true);
    first.load_data(range(), false).await;

    let second = orchestrator(
        schema(one_query("SELECT v FROM logs")),
        engine_with(&[]),
        Arc::new(ScriptedTransport::default()),
        cache,
    );
    second.set_visible(true);
    let shifted = TimeRange::new(range().start_time + 60_000_000, range().end_time + 60_000_000);
    second.load_data(shifted, false).await;

    let state = second.state();
    assert_eq!(state.phase, RunPhase::Completed);
    assert!(state.is_cached_data_differ_with_current_time_range);
}

/// A query aliasing the timestamp column is skipped; the panel's other
/// queries still run.
#[tokio::test]
async fn test_validation_skips_colliding_query() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::with_scripts(vec![ScriptedResponse::ok(
        vec![json!({"v": 1})],
    )]));
    let orchestrator = orchestrator(
        schema(vec![
            PanelQuery {
                query: "SELECT count(*) AS _timestamp FROM logs".to_string(),
                time_shifts: vec![],
            },
            PanelQuery {
                query: "SELECT v FROM logs".to_string(),
                time_shifts: vec![],
            },
        ]),
        engine_with(&[]),
        transport.clone(),
        sled_cache(&dir),
    );
    orchestrator.set_visible(true);
    orchestrator.load_data(range(), false).await;

    let state = orchestrator.state();
    assert_eq!(state.phase, RunPhase::Errored);
    assert!(state.error_detail.is_some());
    assert!(state.is_partial_data, "skipped query leaves the result incomplete");
    assert_eq!(state.data.len(), 2);
    assert!(state.data[0].is_empty());
    assert_eq!(state.data[1].len(), 1);
    assert_eq!(transport.requests().len(), 1);
}

/// Each time-shift entry issues an extra request with a translated window.
#[tokio::test]
async fn test_time_shift_variants_issue_shifted_requests() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::with_scripts(vec![
        ScriptedResponse::ok(vec![json!({"v": 1})]),
        ScriptedResponse::ok(vec![json!({"v": 2})]),
    ]));
    let offset = 3_600_000_000_i64;
    let orchestrator = orchestrator(
        schema(vec![PanelQuery {
            query: "SELECT v FROM logs".to_string(),
            time_shifts: vec![offset],
        }]),
        engine_with(&[]),
        transport.clone(),
        sled_cache(&dir),
    );
    orchestrator.set_visible(true);
    orchestrator.load_data(range(), false).await;

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].time_range, range());
    assert_eq!(requests[1].time_range.start_time, range().start_time - offset);
    assert_eq!(requests[1].time_range.end_time, range().end_time - offset);

    let state = orchestrator.state();
    assert_eq!(state.data.len(), 2);
}

/// Construction through the runtime configuration threads the tuning
/// knobs without manual builder calls.
#[tokio::test]
async fn test_orchestrator_from_config_applies_debounce() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::with_scripts(vec![ScriptedResponse::ok(
        vec![json!({"v": 1})],
    )]));
    let mut config = DashvarConfig::default();
    config.engine.debounce_ms = 1;
    let orchestrator = PanelLoadOrchestrator::from_config(
        schema(one_query("SELECT v FROM logs")),
        "folder-1",
        "dash-1",
        "org-1",
        engine_with(&[]),
        transport.clone(),
        sled_cache(&dir),
        &config,
    );
    orchestrator.set_visible(true);

    let run = tokio::time::timeout(Duration::from_secs(5), orchestrator.load_data(range(), false));
    run.await.expect("configured debounce must elapse promptly");
    assert_eq!(orchestrator.state().phase, RunPhase::Completed);
    assert_eq!(transport.requests().len(), 1);
}

/// Visibility marked before the run starts is retained: the mount order
/// set_visible(true) then load_data must pass the gate, not hang in it.
#[tokio::test]
async fn test_visibility_set_before_run_is_observed() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::with_scripts(vec![ScriptedResponse::ok(
        vec![json!({"v": 1})],
    )]));
    let orchestrator = orchestrator(
        schema(one_query("SELECT v FROM logs")),
        engine_with(&[]),
        transport.clone(),
        sled_cache(&dir),
    );

    // No subscriber exists yet when visibility flips.
    orchestrator.set_visible(true);

    let run = tokio::time::timeout(Duration::from_secs(5), orchestrator.load_data(range(), false));
    run.await.expect("run must not block in the visibility gate");

    assert_eq!(orchestrator.state().phase, RunPhase::Completed);
    assert_eq!(transport.requests().len(), 1);
}

/// Force reload bypasses the visibility gate.
#[tokio::test]
async fn test_force_load_bypasses_visibility() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::with_scripts(vec![ScriptedResponse::ok(
        vec![json!({"v": 1})],
    )]));
    let orchestrator = orchestrator(
        schema(one_query("SELECT v FROM logs")),
        engine_with(&[]),
        transport.clone(),
        sled_cache(&dir),
    );
    // Never marked visible.
    orchestrator.load_data(range(), true).await;

    assert_eq!(orchestrator.state().phase, RunPhase::Completed);
    assert_eq!(transport.requests().len(), 1);
}
