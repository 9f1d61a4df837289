//! Test utilities for mesh integration tests

use credmesh_core::{logging, MeshConfig};
use credmesh_trust_mesh::MeshInstance;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

/// Reference topology rooted in a fresh temp directory
pub fn temp_config(tenant: &str) -> MeshConfig {
    logging::init_for_tests();
    let dir = std::env::temp_dir().join(format!("credmesh_it_{}", uuid::Uuid::new_v4()));
    MeshConfig::demo(tenant, dir)
}

/// Initialize the tenant on disk and open every node
pub async fn open_mesh(config: &MeshConfig) -> MeshInstance {
    MeshInstance::initialize(config).unwrap();
    MeshInstance::open(config.clone()).await.unwrap()
}

/// Every listed edge observes the claim with the given stance
pub async fn observe_all(mesh: &MeshInstance, edges: &[&str], claim_id: &str, stance: &str) {
    for (sample, edge) in edges.iter().enumerate() {
        mesh.observe(
            edge,
            claim_id,
            "field report",
            json!({"stance": stance, "sample": sample}),
        )
        .await
        .unwrap();
    }
}

pub const ALL_EDGES: [&str; 3] = ["edge-a", "edge-b", "edge-c"];

pub const OBSERVER: &str = "aggregator-a";

/// Rewrite one JSON line of a log file in place
pub fn edit_log_line(path: &Path, line: usize, edit: impl FnOnce(&mut Value)) {
    let raw = fs::read_to_string(path).unwrap();
    let mut lines: Vec<String> = raw.lines().map(str::to_string).collect();
    let mut value: Value = serde_json::from_str(&lines[line]).unwrap();
    edit(&mut value);
    lines[line] = serde_json::to_string(&value).unwrap();
    fs::write(path, lines.join("\n") + "\n").unwrap();
}

/// Line index of the first record of `kind` in a mesh log
pub fn first_line_of_kind(path: &Path, kind: &str) -> Option<usize> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .position(|line| {
            serde_json::from_str::<Value>(line)
                .map(|v| v["record"]["kind"] == kind)
                .unwrap_or(false)
        })
}

pub fn cleanup(config: &MeshConfig) {
    let _ = fs::remove_dir_all(&config.data_dir);
}
