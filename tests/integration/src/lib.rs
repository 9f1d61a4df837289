//! End-to-end tests for the credibility mesh
//!
//! This test suite validates, against full in-process mesh instances:
//! - Partition safety and recovery within one recomputation cycle
//! - Correlated-group failure never promoting a claim
//! - Quorum diversity rules end to end
//! - Idempotent replay of replicated and persisted entries
//! - Seal chain tamper detection by the verifier
//! - Source sequence replay detection and quarantine
//! - Cycles that keep running past a failing node

pub mod test_utils;

#[cfg(test)]
mod partition_recovery_tests;

#[cfg(test)]
mod correlated_failure_tests;

#[cfg(test)]
mod quorum_e2e_tests;

#[cfg(test)]
mod replay_tests;

#[cfg(test)]
mod seal_tamper_tests;

#[cfg(test)]
mod source_sync_tests;

#[cfg(test)]
mod cycle_resilience_tests;
