//! Source ordering across the mesh
//!
//! An edge's sequence numbers travel with its envelopes. A replay under a
//! used sequence number is flagged by every validator that sees it and
//! quarantines the source, without disturbing evidence already counted.

use crate::test_utils::*;
use credmesh_core::{current_timestamp_ms, ClaimStatus};
use credmesh_crypto::Keyring;
use credmesh_trust_mesh::service::KEYRING_FILE;
use credmesh_trust_mesh::{
    EvidenceEnvelope, IntegritySignal, MeshRecord, SourceStamp, Verdict,
};

#[tokio::test]
async fn test_replayed_sequence_quarantines_source() {
    let config = temp_config("tenant-source-sync");
    let mut mesh = open_mesh(&config).await;
    observe_all(&mesh, &ALL_EDGES, "claim-sync", "supports").await;
    mesh.run_cycle().await.unwrap();
    assert_eq!(mesh.claim_status(OBSERVER, "claim-sync").unwrap(), ClaimStatus::Verified);

    let original = mesh
        .handle("edge-a")
        .unwrap()
        .snapshot()
        .entries
        .iter()
        .find_map(|e| match &e.record {
            MeshRecord::Envelope(env) if env.signer_node_id == "edge-a" => Some(env.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(original.source_seq, 1);

    let keyring = Keyring::load(config.tenant_dir().join(KEYRING_FILE)).unwrap();
    let replayed = EvidenceEnvelope::create_stamped(
        mesh.directory().backend(),
        &keyring.keypair("edge-a").unwrap(),
        "edge-a",
        "claim-sync",
        original.payload.clone(),
        current_timestamp_ms(),
        SourceStamp { source_seq: 1, ttl_ms: original.ttl_ms },
    )
    .unwrap();
    assert_ne!(replayed.envelope_id, original.envelope_id);
    mesh.inject_envelope("edge-a", replayed.clone()).await.unwrap();
    mesh.run_cycle().await.unwrap();

    let validator = mesh.handle("validator-b1").unwrap().snapshot();
    let flag = validator
        .entries
        .iter()
        .find_map(|e| match &e.record {
            MeshRecord::Flag(f) if f.raised_by == "validator-b1" => Some(f.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(flag.signal, IntegritySignal::ReplayDetected);
    assert_eq!(flag.flagged_node, "edge-a");
    assert_eq!(flag.record_ref, replayed.envelope_id);

    // The original envelope still counts
    assert_eq!(mesh.claim_status(OBSERVER, "claim-sync").unwrap(), ClaimStatus::Verified);

    let summary = mesh.summary().await.unwrap();
    assert!(summary.sources.quarantined_sources.contains("edge-a"));
    assert_eq!(summary.sources.signals.get("replay_detected"), Some(&1));
    assert_eq!(mesh.verify().unwrap().verdict, Verdict::Pass);

    mesh.shutdown().await;
    cleanup(&config);
}
