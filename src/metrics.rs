use metrics::{counter, histogram};
use tracing::trace;

// Recorded through the `metrics` facade so the Prometheus recorder installed
// in main renders them at `/metrics`. Each also leaves a trace event.

pub fn inc_requests(route: &'static str) {
    counter!("buybox_requests_total", "route" => route).increment(1);
    trace!(
        target = "buybox.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn filter_rejection(stage: &'static str, reason: &'static str) {
    counter!("buybox_filter_rejections_total", "stage" => stage, "reason" => reason).increment(1);
    trace!(
        target = "buybox.metrics",
        stage = stage,
        reason = reason,
        "filter_rejections_total_inc"
    );
}

pub fn merge_outcome(outcome: &'static str) {
    counter!("buybox_merge_outcomes_total", "outcome" => outcome).increment(1);
    trace!(
        target = "buybox.metrics",
        outcome = outcome,
        "merge_outcomes_total_inc"
    );
}

pub fn run_elapsed(elapsed_ms: u128) {
    histogram!("buybox_ingestion_run_ms").record(elapsed_ms as f64);
    trace!(
        target = "buybox.metrics",
        elapsed_ms = elapsed_ms as u64,
        "ingestion_run_elapsed"
    );
}
