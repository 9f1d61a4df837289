//! Correlated failure
//!
//! Correlation group g1 spans all three regions. Cut off on its own it
//! can produce three confirmations with full region coverage, but a single
//! group must never be enough.

use crate::test_utils::*;
use credmesh_core::ClaimStatus;
use credmesh_trust_mesh::scenario::{BASELINE_CLAIM, CORRELATED_CLAIM};
use credmesh_trust_mesh::{
    CorrelationRisk, DecisionReason, MeshRecord, ScenarioController, ScenarioPhase, Verdict,
};

#[tokio::test]
async fn test_single_group_never_verifies_and_recovers() {
    let config = temp_config("tenant-correlated");
    let mut mesh = open_mesh(&config).await;

    {
        let mut controller = ScenarioController::new(&mut mesh).unwrap();
        controller.run(ScenarioPhase::Baseline).await.unwrap();

        let failure = controller.run(ScenarioPhase::CorrelatedFailure).await.unwrap();
        assert!(failure.isolated.contains("validator-a1"));
        assert!(failure.isolated.contains("validator-b2"));
        assert!(failure.isolated.contains("validator-c2"));
        assert!(!failure.isolated.contains("validator-b1"));
        assert_eq!(failure.claims[CORRELATED_CLAIM], ClaimStatus::Unknown);
        assert_eq!(failure.claims[BASELINE_CLAIM], ClaimStatus::Unknown);
        // The forged envelope was flagged inside the mesh
        assert_eq!(failure.verification, Verdict::Pass);
    }

    let aggregation = mesh
        .latest_aggregation(OBSERVER, CORRELATED_CLAIM)
        .unwrap()
        .unwrap();
    assert_eq!(aggregation.confirm_count, 3);
    assert_eq!(aggregation.regions_covered.len(), 3);
    assert_eq!(aggregation.groups_covered.len(), 1);
    assert_eq!(aggregation.reason, DecisionReason::InsufficientDiversity);

    let report = mesh.verify().unwrap();
    assert!(report.integrity_flags >= 1);
    assert!(report
        .signature_failures
        .iter()
        .all(|f| f.flagged_in_mesh && f.signer == "edge-a"));

    {
        let mut controller = ScenarioController::new(&mut mesh).unwrap();
        let recovery = controller.run(ScenarioPhase::Recovery).await.unwrap();
        assert_eq!(recovery.claims[CORRELATED_CLAIM], ClaimStatus::Verified);
        assert_eq!(recovery.claims[BASELINE_CLAIM], ClaimStatus::Verified);
        assert_eq!(recovery.verification, Verdict::Pass);
    }

    mesh.shutdown().await;
    cleanup(&config);
}

#[tokio::test]
async fn test_forged_envelope_is_excluded_from_tally() {
    let config = temp_config("tenant-forged");
    let mut mesh = open_mesh(&config).await;

    {
        let mut controller = ScenarioController::new(&mut mesh).unwrap();
        controller.run(ScenarioPhase::CorrelatedFailure).await.unwrap();
    }

    let validator = mesh.handle("validator-a1").unwrap().snapshot();
    let flags: Vec<_> = validator
        .entries
        .iter()
        .filter_map(|e| match &e.record {
            MeshRecord::Flag(f) if f.raised_by == "validator-a1" => Some(f),
            _ => None,
        })
        .collect();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].flagged_node, "edge-a");

    mesh.shutdown().await;
    cleanup(&config);
}

#[tokio::test]
async fn test_shared_feed_is_reported_as_correlated() {
    let config = temp_config("tenant-shared-feed");
    let mut mesh = open_mesh(&config).await;

    {
        let mut controller = ScenarioController::new(&mut mesh).unwrap();
        controller.run(ScenarioPhase::Baseline).await.unwrap();
        controller.run(ScenarioPhase::CorrelatedFailure).await.unwrap();
    }

    let summary = mesh.summary().await.unwrap();
    let g1 = summary
        .sources
        .correlation
        .iter()
        .find(|c| c.correlation_group == "g1")
        .unwrap();
    assert_eq!(g1.samples, 3);
    assert_eq!(g1.coefficient, 1.0);
    assert_eq!(g1.risk, CorrelationRisk::Invalid);

    // Baseline evidence carries no reading, so g2 has nothing to correlate
    let g2 = summary
        .sources
        .correlation
        .iter()
        .find(|c| c.correlation_group == "g2")
        .unwrap();
    assert_eq!(g2.risk, CorrelationRisk::Low);

    assert!(summary.sources.regions_over_authority.contains(&"region-a".to_string()));
    assert!(summary.sources.region_authority["region-a"] > config.sync.max_region_authority);

    mesh.shutdown().await;
    cleanup(&config);
}
