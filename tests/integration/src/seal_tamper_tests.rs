//! Seal chain tamper detection
//!
//! Persisted state is edited behind the mesh's back; the verifier must
//! report it, and a node must refuse to start on a log that fails replay.

use crate::test_utils::*;
use credmesh_core::{canonical_json, Logstore, LogstoreError, MeshConfig};
use credmesh_crypto::{compute_seal_hash, compute_snapshot_hash};
use credmesh_trust_mesh::{
    verify_tenant, MeshError, MeshInstance, NodePaths, SealChainEntry, Verdict,
};

async fn sealed_tenant(tenant: &str) -> MeshConfig {
    let config = temp_config(tenant);
    let mut mesh = open_mesh(&config).await;
    observe_all(&mesh, &ALL_EDGES, "claim-sealed", "supports").await;
    mesh.run_cycle().await.unwrap();
    observe_all(&mesh, &["edge-a"], "claim-sealed-2", "supports").await;
    mesh.run_cycles(2).await.unwrap();
    mesh.shutdown().await;

    let report = verify_tenant(&config).unwrap();
    assert_eq!(report.verdict, Verdict::Pass);
    assert!(report.seals_checked >= 2);
    config
}

#[tokio::test]
async fn test_seal_recomputation_reproduces_stored_hashes() {
    let config = sealed_tenant("tenant-recompute").await;
    let paths = NodePaths::for_node(&config.tenant_dir(), "seal-a");
    let chain: Vec<SealChainEntry> = Logstore::<SealChainEntry>::read_file(&paths.seal_mirror)
        .unwrap()
        .into_iter()
        .map(|e| e.record)
        .collect();
    assert!(chain.len() >= 2);

    for seal in &chain {
        let canonical = canonical_json(&seal.aggregation).unwrap();
        assert_eq!(seal.snapshot_hash, compute_snapshot_hash(&canonical));
        assert_eq!(
            seal.seal_hash,
            compute_seal_hash(
                &seal.prev_seal_hash,
                &seal.policy_hash,
                &seal.snapshot_hash,
                &canonical
            )
        );
    }
    cleanup(&config);
}

#[tokio::test]
async fn test_tampered_mirror_is_reported() {
    let config = sealed_tenant("tenant-mirror").await;
    let paths = NodePaths::for_node(&config.tenant_dir(), "seal-a");

    edit_log_line(&paths.seal_mirror, 1, |entry| {
        entry["record"]["policy_hash"] = serde_json::json!("f".repeat(64));
    });

    let report = verify_tenant(&config).unwrap();
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(report.mirror_divergences.len(), 1);
    assert_eq!(report.mirror_divergences[0].first_difference, 1);
    let chain = report.chains.iter().find(|c| c.authority == "seal-a").unwrap();
    assert!(chain.result.is_ok());
    assert!(!chain.mirror_result.as_ref().unwrap().is_ok());

    cleanup(&config);
}

#[tokio::test]
async fn test_tampered_log_record_is_reported() {
    let config = sealed_tenant("tenant-logedit").await;
    let paths = NodePaths::for_node(&config.tenant_dir(), "seal-a");
    let line = first_line_of_kind(&paths.log, "seal").unwrap();

    edit_log_line(&paths.log, line, |entry| {
        entry["record"]["aggregation"]["confirm_count"] = serde_json::json!(99);
    });

    let report = verify_tenant(&config).unwrap();
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(report.entry_id_mismatches.len(), 1);
    assert_eq!(report.entry_id_mismatches[0].0, "seal-a");

    cleanup(&config);
}

#[tokio::test]
async fn test_node_refuses_to_start_on_corrupted_log() {
    let config = sealed_tenant("tenant-corrupt").await;
    let paths = NodePaths::for_node(&config.tenant_dir(), "validator-b1");

    edit_log_line(&paths.log, 2, |entry| {
        entry["seq"] = serde_json::json!(42);
    });

    let report = verify_tenant(&config).unwrap();
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report.unreadable_logs.contains_key("validator-b1"));

    let result = MeshInstance::open(config.clone()).await;
    assert!(matches!(
        result,
        Err(MeshError::Logstore(LogstoreError::CorruptionDetected(_)))
    ));

    cleanup(&config);
}
