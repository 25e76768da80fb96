//! Options resolution collaborator for `query_values` variables.
//!
//! The engine hands the resolver a snapshot of the instance plus the
//! resolved values of its parents; the resolver performs the actual lookup
//! (a distinct-values query against the backend in production, an in-memory
//! table in tests).

use crate::error::EngineError;
use crate::types::{VariableInstance, VariableOption, VariableValue};
use async_trait::async_trait;
use std::collections::HashMap;

/// Resolved parent values keyed by variable name, for filter substitution.
pub type ParentValues = HashMap<String, VariableValue>;

#[async_trait]
pub trait OptionsResolver: Send + Sync {
    /// Resolve the candidate options for one instance.
    ///
    /// Called at most once per load generation of a key; a stale completion
    /// is discarded by the engine, so implementations need no cancellation
    /// support beyond returning.
    async fn resolve(
        &self,
        instance: &VariableInstance,
        parents: &ParentValues,
    ) -> Result<Vec<VariableOption>, EngineError>;
}

/// Ticket for one in-flight load. The generation is monotonically
/// increasing per key; a completion whose generation is no longer current
/// must not mutate instance state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub key: crate::types::IdentityKey,
    pub generation: u64,
}
