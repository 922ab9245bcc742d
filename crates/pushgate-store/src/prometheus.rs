//! Prometheus text exposition of the store's own metrics.
//!
//! Pushed metrics are rendered by the scrape layer; this covers only the
//! `pushgate_*` counters describing the store itself.

use std::fmt::Write;

use crate::metrics::StoreMetricsSnapshot;

/// Render store self-metrics in Prometheus text format.
pub fn render_prometheus(snap: &StoreMetricsSnapshot) -> String {
    let mut out = String::new();

    write_metric(
        &mut out,
        "pushgate_write_requests_total",
        "Write and delete requests applied.",
        "counter",
        snap.requests_applied,
    );
    write_metric(
        &mut out,
        "pushgate_delete_requests_total",
        "Delete requests applied.",
        "counter",
        snap.deletes_applied,
    );
    write_metric(
        &mut out,
        "pushgate_families_written_total",
        "Metric families stored.",
        "counter",
        snap.families_written,
    );
    write_metric(
        &mut out,
        "pushgate_families_rejected_total",
        "Metric families dropped by validation.",
        "counter",
        snap.families_rejected,
    );
    write_metric(
        &mut out,
        "pushgate_metrics_rejected_total",
        "Metrics dropped for inconsistent job/instance labels.",
        "counter",
        snap.metrics_rejected,
    );
    write_metric(
        &mut out,
        "pushgate_checkpoints_total",
        "Checkpoints written.",
        "counter",
        snap.checkpoints_written,
    );
    write_metric(
        &mut out,
        "pushgate_checkpoint_failures_total",
        "Checkpoints that failed.",
        "counter",
        snap.checkpoint_failures,
    );
    write_metric(
        &mut out,
        "pushgate_last_checkpoint_timestamp_seconds",
        "Unix time of the last successful checkpoint.",
        "gauge",
        snap.last_checkpoint_unix_secs,
    );
    write_metric(
        &mut out,
        "pushgate_write_queue_length",
        "Write requests waiting for the writer.",
        "gauge",
        snap.queue_depth,
    );

    out
}

fn write_metric(out: &mut String, name: &str, help: &str, kind: &str, value: impl std::fmt::Display) {
    // Writing to a String cannot fail.
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
