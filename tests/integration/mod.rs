//! Integration tests for the variable resolution and panel load engine

mod cascade_resolution;
mod cycle_detection;
mod panel_orchestration;
mod store_commit;
