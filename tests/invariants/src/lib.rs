//! Kestrel Property-Based Invariant Tests
//!
//! Uses proptest to check the properties consensus safety rests on:
//! - Vote set majority threshold, uniqueness and conflict handling
//! - Per-peer bound on catch-up rounds
//! - Contiguous block storage
//! - Stale round entries leaving the state machine untouched
//! - Wire message size limits

#[cfg(test)]
mod fixtures;

pub mod chain_store_invariants;
pub mod state_machine_invariants;
pub mod vote_set_invariants;
pub mod wire_invariants;
