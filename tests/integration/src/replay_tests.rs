//! Replay idempotence
//!
//! Re-delivering entries a node already holds, through replication or a
//! restart, changes neither the log nor anything derived from it.

use crate::test_utils::*;
use credmesh_core::ClaimStatus;
use credmesh_trust_mesh::{MeshInstance, MeshSummary, PushBatch};

#[tokio::test]
async fn test_replayed_batch_is_a_no_op() {
    let config = temp_config("tenant-replay");
    let mut mesh = open_mesh(&config).await;
    observe_all(&mesh, &ALL_EDGES, "claim-replay", "supports").await;
    mesh.run_cycle().await.unwrap();

    let aggregator = mesh.handle(OBSERVER).unwrap().clone();
    let before = aggregator.snapshot();
    let status_before = mesh.claim_status(OBSERVER, "claim-replay").unwrap();
    assert_eq!(status_before, ClaimStatus::Verified);

    // Everything the aggregator holds, pushed back at it twice
    for _ in 0..2 {
        let ack = aggregator
            .accept_push(PushBatch {
                tenant_id: config.tenant_id.clone(),
                from_node: "edge-b".to_string(),
                after_seq: 0,
                entries: before.entries.as_ref().clone(),
            })
            .await
            .unwrap();
        assert_eq!(ack.accepted, 0);
        assert_eq!(ack.rejected, 0);
        assert_eq!(ack.duplicates, before.entries.len());
    }

    let after = aggregator.snapshot();
    assert_eq!(after.entries.len(), before.entries.len());
    assert_eq!(after.last_seq(), before.last_seq());
    assert_eq!(
        mesh.claim_status(OBSERVER, "claim-replay").unwrap(),
        status_before
    );

    // A further cycle with nothing new appends nothing anywhere
    let report = mesh.run_cycle().await.unwrap();
    assert_eq!(report.appended(), 0);

    mesh.shutdown().await;
    cleanup(&config);
}

#[tokio::test]
async fn test_restart_replays_persisted_logs() {
    let config = temp_config("tenant-restart");
    let lengths: Vec<(String, usize)>;
    {
        let mut mesh = open_mesh(&config).await;
        observe_all(&mesh, &ALL_EDGES, "claim-restart", "supports").await;
        mesh.run_cycles(2).await.unwrap();
        lengths = mesh
            .handles()
            .map(|h| (h.node_id().to_string(), h.snapshot().entries.len()))
            .collect();
        mesh.shutdown().await;
    }

    let before = MeshSummary::from_disk(&config).unwrap();
    let mesh = MeshInstance::open(config.clone()).await.unwrap();
    for (node_id, length) in &lengths {
        assert_eq!(mesh.handle(node_id).unwrap().snapshot().entries.len(), *length);
    }
    assert_eq!(
        mesh.claim_status(OBSERVER, "claim-restart").unwrap(),
        ClaimStatus::Verified
    );

    let after = mesh.summary().await.unwrap();
    assert_eq!(after.claims, before.claims);
    assert_eq!(after.last_seal, before.last_seal);
    assert_eq!(after.verification.verdict, before.verification.verdict);

    mesh.shutdown().await;
    cleanup(&config);
}
