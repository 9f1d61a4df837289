//! Read-side views over a node's log.

use credmesh_core::ClaimStatus;
use std::collections::BTreeMap;

use crate::envelope::{AggregationRecord, IntegrityFlag, MeshEntry, MeshRecord};

/// Latest aggregation per claim, optionally from one aggregator only.
///
/// Within one aggregator the last record in log order wins; across
/// aggregators the newest `computed_at` does, ties broken by id.
pub fn latest_aggregations<'a>(
    entries: &'a [MeshEntry],
    aggregator_id: Option<&str>,
) -> BTreeMap<&'a str, &'a AggregationRecord> {
    let mut latest: BTreeMap<&'a str, &'a AggregationRecord> = BTreeMap::new();
    for entry in entries {
        let MeshRecord::Aggregation(record) = &entry.record else {
            continue;
        };
        if aggregator_id.is_some_and(|id| id != record.aggregator_id) {
            continue;
        }
        match latest.get(record.claim_id.as_str()) {
            Some(current)
                if current.aggregator_id != record.aggregator_id
                    && (current.computed_at, &current.aggregation_id)
                        > (record.computed_at, &record.aggregation_id) => {}
            _ => {
                latest.insert(record.claim_id.as_str(), record);
            }
        }
    }
    latest
}

/// Status of one claim as seen in `entries`. Unknown until aggregated.
pub fn claim_status(entries: &[MeshEntry], claim_id: &str, aggregator_id: Option<&str>) -> ClaimStatus {
    latest_aggregations(entries, aggregator_id)
        .get(claim_id)
        .map(|a| a.resulting_status)
        .unwrap_or_default()
}

pub fn count_by_kind(entries: &[MeshEntry]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for entry in entries {
        *counts.entry(entry.record.kind()).or_insert(0) += 1;
    }
    counts
}

pub fn integrity_flags(entries: &[MeshEntry]) -> Vec<&IntegrityFlag> {
    entries
        .iter()
        .filter_map(|e| match &e.record {
            MeshRecord::Flag(flag) => Some(flag),
            _ => None,
        })
        .collect()
}
