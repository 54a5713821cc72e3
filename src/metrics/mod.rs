//! Engine metrics.
//!
//! Recorded through the `metrics` facade. Without an installed recorder the
//! macros are no-ops, so library users pick their own exporter.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

use crate::engine::ApplyResult;

// Metric names as constants for consistency
pub const REAPPLY_RUNS_TOTAL: &str = "cluster_reapply_runs_total";
pub const REAPPLY_DURATION_SECONDS: &str = "cluster_reapply_duration_seconds";
pub const REAPPLY_RESOURCES_PROCESSED: &str = "cluster_reapply_resources_processed_total";
pub const CLUSTERS_CHANGED_TOTAL: &str = "clusters_changed_total";
pub const RESOURCES_REBOUND_TOTAL: &str = "resources_rebound_total";

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(REAPPLY_RUNS_TOTAL, "Total number of full cluster type reapply runs");
    describe_histogram!(
        REAPPLY_DURATION_SECONDS,
        "Duration of full cluster type reapply runs in seconds"
    );
    describe_counter!(
        REAPPLY_RESOURCES_PROCESSED,
        "Member resources examined by reapply runs"
    );
    describe_counter!(
        CLUSTERS_CHANGED_TOTAL,
        "Cluster documents written by reapply runs, by change (created/updated/removed)"
    );
    describe_counter!(
        RESOURCES_REBOUND_TOTAL,
        "Member resources bound to or unbound from clusters, by direction"
    );
}

/// Record the outcome of a full reapply run
pub fn record_apply(result: &ApplyResult, elapsed: Duration) {
    counter!(REAPPLY_RUNS_TOTAL).increment(1);
    histogram!(REAPPLY_DURATION_SECONDS).record(elapsed.as_secs_f64());
    counter!(REAPPLY_RESOURCES_PROCESSED).increment(result.processed_resources as u64);

    for (change, count) in [
        ("created", result.clusters_created),
        ("updated", result.clusters_updated),
        ("removed", result.clusters_removed),
    ] {
        if count > 0 {
            counter!(CLUSTERS_CHANGED_TOTAL, "change" => change).increment(count as u64);
        }
    }
    for (direction, count) in [("bound", result.resources_bound), ("unbound", result.resources_unbound)] {
        if count > 0 {
            counter!(RESOURCES_REBOUND_TOTAL, "direction" => direction).increment(count as u64);
        }
    }
}
