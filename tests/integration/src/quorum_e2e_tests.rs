//! Quorum diversity end to end
//!
//! Five validators across three regions and two groups with
//! `k_required=3, n_total=5, min_regions=2, min_correlation_groups=2`.

use crate::test_utils::*;
use credmesh_core::{ClaimStatus, MeshConfig, QuorumPolicy};
use credmesh_trust_mesh::DecisionReason;

fn two_region_policy(config: &mut MeshConfig) {
    config.policy.tiers.insert(
        "standard".to_string(),
        QuorumPolicy {
            k_required: 3,
            n_total: 5,
            min_regions: 2,
            min_correlation_groups: 2,
            out_of_band_required: false,
            envelope_ttl_ms: None,
        },
    );
}

#[tokio::test]
async fn test_three_confirms_over_two_regions_then_one_region() {
    let mut config = temp_config("tenant-e2e");
    two_region_policy(&mut config);
    let mut mesh = open_mesh(&config).await;

    // Leaves validator-b1 (b, g2), validator-b2 (b, g1), validator-c1 (c, g2)
    mesh.update_reachability(|m| {
        m.set_offline("validator-a1");
        m.set_offline("validator-c2");
    })
    .await;
    observe_all(&mesh, &ALL_EDGES, "claim-e2e", "supports").await;
    mesh.run_cycle().await.unwrap();

    let verified = mesh.latest_aggregation(OBSERVER, "claim-e2e").unwrap().unwrap();
    assert_eq!(verified.resulting_status, ClaimStatus::Verified);
    assert_eq!(verified.confirm_count, 3);
    assert_eq!(verified.regions_covered.len(), 2);
    assert_eq!(verified.groups_covered.len(), 2);
    assert!(verified.quorum_met);

    // Region C's vote stops counting: one region left
    mesh.update_reachability(|m| {
        m.isolate("region-c", ["edge-c", "validator-c1"]);
    })
    .await;
    mesh.run_cycle().await.unwrap();

    let unknown = mesh.latest_aggregation(OBSERVER, "claim-e2e").unwrap().unwrap();
    assert_eq!(unknown.resulting_status, ClaimStatus::Unknown);
    assert_eq!(unknown.reason, DecisionReason::InsufficientDiversity);
    assert_eq!(unknown.regions_covered.len(), 1);
    assert!(!unknown.quorum_met);

    // Both decisions were sealed in order
    let summary = mesh.summary().await.unwrap();
    assert_eq!(summary.claims["claim-e2e"].status, ClaimStatus::Unknown);
    let seal = summary.last_seal.unwrap();
    assert_eq!(seal.claim_id, "claim-e2e");
    assert!(seal.seal_index >= 1);
    assert!(mesh.verify().unwrap().passed());

    mesh.shutdown().await;
    cleanup(&config);
}

#[tokio::test]
async fn test_critical_claim_waits_for_out_of_band_confirmation() {
    let config = temp_config("tenant-critical");
    let mut mesh = open_mesh(&config).await;

    mesh.update_reachability(|m| m.set_offline("validator-c1")).await;
    for edge in ALL_EDGES {
        mesh.observe(
            edge,
            "claim-dam",
            "critical: spillway gate failure",
            serde_json::json!({"stance": "supports"}),
        )
        .await
        .unwrap();
    }
    mesh.run_cycle().await.unwrap();

    let waiting = mesh.latest_aggregation(OBSERVER, "claim-dam").unwrap().unwrap();
    assert_eq!(waiting.policy_tier, "critical");
    assert_eq!(waiting.confirm_count, 4);
    assert_eq!(waiting.resulting_status, ClaimStatus::Pending);
    assert_eq!(waiting.reason, DecisionReason::OutOfBandMissing);
    assert!(!waiting.out_of_band_confirmed);

    mesh.update_reachability(|m| m.restore("validator-c1")).await;
    mesh.run_cycle().await.unwrap();

    let verified = mesh.latest_aggregation(OBSERVER, "claim-dam").unwrap().unwrap();
    assert_eq!(verified.resulting_status, ClaimStatus::Verified);
    assert!(verified.out_of_band_confirmed);

    mesh.shutdown().await;
    cleanup(&config);
}
