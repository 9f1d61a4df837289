//! Cycle resilience
//!
//! A node whose step fails is reported and skipped; the rest of the
//! pipeline still runs and the node catches up once it can write again.

use crate::test_utils::*;
use credmesh_core::NodeRole;
use credmesh_trust_mesh::{MeshRecord, NodePaths};
use std::fs;

#[tokio::test]
async fn test_failing_edge_does_not_abort_the_cycle() {
    let config = temp_config("tenant-step-failure");
    let mut mesh = open_mesh(&config).await;
    observe_all(&mesh, &ALL_EDGES, "claim-resilience", "supports").await;

    // A directory where edge-a stages its next write makes that write fail
    let blocked = NodePaths::for_node(&config.tenant_dir(), "edge-a")
        .log
        .with_extension("jsonl.tmp");
    fs::create_dir_all(&blocked).unwrap();

    let report = mesh.run_cycle().await.unwrap();
    assert_eq!(report.step_failures.len(), 1);
    assert_eq!(report.step_failures[0].0, "edge-a");
    for edge in ["edge-b", "edge-c"] {
        let step = report.steps.iter().find(|s| s.node_id == edge).unwrap();
        assert!(step.appended >= 1);
    }
    assert!(report.steps.iter().any(|s| s.role == NodeRole::Validator && s.appended >= 1));
    assert!(report.steps.iter().any(|s| s.node_id == OBSERVER));
    assert!(mesh.handle("edge-a").unwrap().snapshot().entries.is_empty());

    fs::remove_dir_all(&blocked).unwrap();
    let report = mesh.run_cycle().await.unwrap();
    assert!(report.step_failures.is_empty());
    let edge_a = mesh.handle("edge-a").unwrap().snapshot();
    assert!(edge_a.entries.iter().any(|e| matches!(
        &e.record,
        MeshRecord::Envelope(env) if env.signer_node_id == "edge-a"
    )));

    mesh.shutdown().await;
    cleanup(&config);
}
