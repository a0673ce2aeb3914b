//! Two-source reconciliation of metrics and location records.

use std::collections::{HashMap, HashSet};

use ltc_core::{normalize_name, FacilityRecord, LocationRecord, MetricsRecord};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub matched: usize,
    pub metrics_only: usize,
    pub location_only: usize,
    /// Location records overwritten by a later record with the same key.
    pub duplicate_location_keys: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub records: Vec<FacilityRecord>,
    pub report: ReconcileReport,
}

/// Join metrics and location records on the normalized name.
///
/// Output holds every metrics record, in order, followed by the location
/// records whose key never appears on the metrics side, in order. Duplicate
/// location keys resolve to the last record.
pub fn reconcile(metrics: &[MetricsRecord], locations: &[LocationRecord]) -> Reconciliation {
    let mut report = ReconcileReport::default();

    let mut by_key: HashMap<String, &LocationRecord> = HashMap::with_capacity(locations.len());
    for location in locations {
        let key = normalize_name(&location.name);
        if let Some(previous) = by_key.insert(key.clone(), location) {
            report.duplicate_location_keys += 1;
            warn!(
                key = %key,
                replaced = %previous.name,
                kept = %location.name,
                "duplicate location key; keeping the later record"
            );
        }
    }

    let mut records = Vec::with_capacity(metrics.len() + locations.len());
    let mut metric_keys = HashSet::with_capacity(metrics.len());
    for record in metrics {
        let key = normalize_name(&record.name);
        match by_key.get(&key) {
            Some(location) => {
                records.push(FacilityRecord::merged(record, location));
                report.matched += 1;
            }
            None if record.is_provincial => {
                records.push(FacilityRecord::metrics_only(record));
                report.metrics_only += 1;
            }
            None => {
                match closest_location(&key, by_key.keys()) {
                    Some((closest, similarity)) => warn!(
                        home = %record.name,
                        closest = %closest,
                        similarity,
                        "no location match"
                    ),
                    None => warn!(home = %record.name, "no location match"),
                }
                records.push(FacilityRecord::metrics_only(record));
                report.metrics_only += 1;
            }
        }
        metric_keys.insert(key);
    }

    for location in locations {
        if !metric_keys.contains(&normalize_name(&location.name)) {
            records.push(FacilityRecord::location_only(location));
            report.location_only += 1;
        }
    }

    info!(
        matched = report.matched,
        metrics_only = report.metrics_only,
        location_only = report.location_only,
        duplicate_location_keys = report.duplicate_location_keys,
        total = records.len(),
        "reconciliation complete"
    );

    Reconciliation { records, report }
}

/// Most similar location key, reported to operators only. Ties go to the
/// lexicographically smaller key so the log line is stable.
fn closest_location<'a>(
    key: &str,
    candidates: impl Iterator<Item = &'a String>,
) -> Option<(&'a str, f64)> {
    candidates
        .map(|candidate| (candidate.as_str(), jaro_winkler(key, candidate)))
        .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)))
}
