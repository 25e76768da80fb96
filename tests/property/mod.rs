//! Property-based tests for graph and serialization invariants
