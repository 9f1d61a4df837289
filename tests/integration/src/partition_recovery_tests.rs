//! Partition and recovery
//!
//! Region B is cut off from the rest of the mesh. Claims that need three
//! regions must drop to UNKNOWN while it lasts and converge back within
//! one cycle after reachability is restored.

use crate::test_utils::*;
use credmesh_core::ClaimStatus;
use credmesh_trust_mesh::scenario::{BASELINE_CLAIM, PARTITION_CLAIM};
use credmesh_trust_mesh::{ScenarioController, ScenarioPhase, Verdict};

#[tokio::test]
async fn test_partition_falls_back_to_unknown_and_recovers() {
    let config = temp_config("tenant-partition");
    let mut mesh = open_mesh(&config).await;

    {
        let mut controller = ScenarioController::new(&mut mesh).unwrap();
        assert_eq!(controller.observer(), OBSERVER);

        let baseline = controller.run(ScenarioPhase::Baseline).await.unwrap();
        assert_eq!(baseline.claims[BASELINE_CLAIM], ClaimStatus::Verified);
        assert_eq!(baseline.verification, Verdict::Pass);

        let partition = controller.run(ScenarioPhase::Partition).await.unwrap();
        assert!(partition.isolated.contains("validator-b1"));
        assert!(partition.isolated.contains("edge-b"));
        // Region B's votes no longer count, so three regions are not covered
        assert_eq!(partition.claims[BASELINE_CLAIM], ClaimStatus::Unknown);
        assert_eq!(partition.claims[PARTITION_CLAIM], ClaimStatus::Unknown);
        assert_ne!(partition.claims[PARTITION_CLAIM], ClaimStatus::Verified);
        assert_eq!(partition.verification, Verdict::Pass);

        let recovery = controller.run(ScenarioPhase::Recovery).await.unwrap();
        assert_eq!(recovery.cycles, 1);
        assert!(recovery.isolated.is_empty());
        assert_eq!(recovery.claims[BASELINE_CLAIM], ClaimStatus::Verified);
        assert_eq!(recovery.claims[PARTITION_CLAIM], ClaimStatus::Verified);
        assert_eq!(recovery.verification, Verdict::Pass);
    }

    mesh.shutdown().await;
    cleanup(&config);
}

#[tokio::test]
async fn test_isolated_region_cannot_verify_on_its_own() {
    let config = temp_config("tenant-island");
    let mut mesh = open_mesh(&config).await;

    mesh.update_reachability(|m| m.isolate("region-b", ["edge-b", "validator-b1", "validator-b2"]))
        .await;
    observe_all(&mesh, &["edge-b"], "claim-island", "supports").await;
    mesh.run_cycles(2).await.unwrap();

    // Region B validators did vote, but nobody outside the island saw it
    let b1 = mesh.handle("validator-b1").unwrap().snapshot();
    assert!(b1
        .entries
        .iter()
        .any(|e| e.record.claim_id() == Some("claim-island") && e.origin == "validator-b1"));
    assert_eq!(
        mesh.claim_status(OBSERVER, "claim-island").unwrap(),
        ClaimStatus::Unknown
    );

    // Once healed, edge-b's envelope reaches validators in every region
    mesh.update_reachability(|m| m.restore_all()).await;
    mesh.run_cycle().await.unwrap();
    assert_eq!(
        mesh.claim_status(OBSERVER, "claim-island").unwrap(),
        ClaimStatus::Verified
    );
    assert!(mesh.verify().unwrap().passed());

    mesh.shutdown().await;
    cleanup(&config);
}
