//! Dashvar: Variable Resolution and Panel Load Orchestration
//!
//! Scoped dashboard variables form a dependency graph; a resolution engine
//! loads them in dependency order with visibility gating and cascade
//! semantics, and per-panel orchestrators turn committed variable state
//! into cancellable streaming queries backed by a local result cache.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod logging;
pub mod panel;
pub mod store;
pub mod transport;
pub mod types;
