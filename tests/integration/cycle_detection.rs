//! Cycle detection at engine construction time.

use super::test_utils::{query_var, StaticResolver};
use dashvar::engine::VariableResolutionEngine;
use dashvar::error::{EngineError, GraphError};
use dashvar::store::VariableStore;
use dashvar::types::PanelTabMap;
use std::collections::HashMap;
use std::sync::Arc;

fn build_engine(
    definitions: &[dashvar::types::VariableDefinition],
) -> Result<VariableResolutionEngine, EngineError> {
    let store = VariableStore::from_definitions(definitions, PanelTabMap::new()).unwrap();
    VariableResolutionEngine::new(store, Arc::new(StaticResolver::new(HashMap::new())))
}

/// A two-variable cycle is rejected before any load can start.
#[test]
fn test_mutual_cycle_rejected_at_construction() {
    let result = build_engine(&[
        query_var("a", &["b = '$b'"]),
        query_var("b", &["a = '$a'"]),
    ]);

    let Err(EngineError::Graph(GraphError::CyclicDependency { path })) = result else {
        panic!("expected cycle error");
    };
    // Path closes on itself and names both participants.
    assert_eq!(path.first(), path.last());
    assert!(path.len() >= 3);
}

/// A variable referencing itself is the smallest cycle.
#[test]
fn test_self_reference_rejected() {
    let result = build_engine(&[query_var("a", &["a != '$a'"])]);
    assert!(matches!(
        result,
        Err(EngineError::Graph(GraphError::CyclicDependency { .. }))
    ));
}

/// Diamond-shaped sharing is not a cycle.
#[test]
fn test_diamond_dependencies_accepted() {
    let result = build_engine(&[
        query_var("root", &[]),
        query_var("left", &["r = '$root'"]),
        query_var("right", &["r = '$root'"]),
        query_var("leaf", &["l = '$left'", "r = '$right'"]),
    ]);
    assert!(result.is_ok());
}

/// Unknown references are ignored, never phantom nodes.
#[test]
fn test_unknown_reference_is_skipped() {
    let engine = build_engine(&[query_var("a", &["x = '$missing'"])]).unwrap();
    assert_eq!(engine.graph().len(), 1);
}
