//! Quorum and Sealing Benchmarks
//!
//! - Quorum evaluation over the demo topology's five validators
//! - Quorum evaluation with many superseded revisions per validator
//! - Seal hash computation over a canonical aggregation record

use credmesh_core::{canonical_json, MeshConfig, NodeRole, Vote};
use credmesh_crypto::{compute_seal_hash, compute_snapshot_hash, Ed25519Backend, Keyring, GENESIS_MARKER};
use credmesh_trust_mesh::{
    FederatedQuorumEngine, MeshDirectory, QuorumInput, ValidationRecord, VoteDraft,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeSet;
use std::sync::Arc;

fn demo_mesh() -> (MeshDirectory, Keyring, FederatedQuorumEngine) {
    let config = MeshConfig::demo("bench", std::env::temp_dir());
    let keyring = Keyring::generate(&Ed25519Backend, config.nodes.iter().map(|n| n.node_id.as_str()));
    let directory = MeshDirectory::from_config(&config, &keyring).unwrap();
    let engine = FederatedQuorumEngine::new(Arc::new(config.policy.clone())).unwrap();
    (directory, keyring, engine)
}

fn votes(directory: &MeshDirectory, keyring: &Keyring, revisions: u64) -> Vec<ValidationRecord> {
    let mut out = Vec::new();
    for validator in directory.with_role(NodeRole::Validator) {
        let keypair = keyring.keypair(&validator.node_id).unwrap();
        for revision in 1..=revisions {
            let vote = if revision % 2 == 0 { Vote::Deny } else { Vote::Confirm };
            out.push(
                ValidationRecord::create(
                    &Ed25519Backend,
                    &keypair,
                    &validator.node_id,
                    VoteDraft {
                        claim_id: "claim-bench".into(),
                        vote,
                        revision,
                        reasons: vec![],
                        envelope_ids: vec![],
                    },
                    revision,
                )
                .unwrap(),
            );
        }
    }
    out
}

fn bench_quorum_evaluate(c: &mut Criterion) {
    let (directory, keyring, engine) = demo_mesh();
    let live: BTreeSet<String> = directory
        .with_role(NodeRole::Validator)
        .map(|n| n.node_id.clone())
        .collect();

    let mut group = c.benchmark_group("quorum_evaluate");
    for revisions in [1u64, 8, 64] {
        let records = votes(&directory, &keyring, revisions);
        group.bench_with_input(BenchmarkId::from_parameter(revisions), &records, |b, records| {
            b.iter(|| {
                let input = QuorumInput {
                    claim_id: "claim-bench",
                    content: Some("bench claim"),
                    validations: records.iter().collect(),
                    live_validators: Some(&live),
                };
                black_box(engine.evaluate(&directory, &input).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_seal_hash(c: &mut Criterion) {
    let (directory, keyring, engine) = demo_mesh();
    let records = votes(&directory, &keyring, 1);
    let input = QuorumInput {
        claim_id: "claim-bench",
        content: None,
        validations: records.iter().collect(),
        live_validators: None,
    };
    let outcome = engine.evaluate(&directory, &input).unwrap();
    let canonical = canonical_json(&outcome).unwrap();

    c.bench_function("seal_hash", |b| {
        b.iter(|| {
            let snapshot = compute_snapshot_hash(black_box(&canonical));
            black_box(compute_seal_hash(GENESIS_MARKER, engine.policy_hash(), &snapshot, &canonical))
        })
    });
}

criterion_group!(benches, bench_quorum_evaluate, bench_seal_hash);
criterion_main!(benches);
