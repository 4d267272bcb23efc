use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, HistogramOpts, IntCounterVec,
};

const LATENCY_BUCKETS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

pub const OUTCOME_ALLOW: &str = "allow";

// Decisions by outcome
pub static DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pep_decisions_total",
        "Access decisions enforced by pingpep, by outcome",
        &["outcome"]
    )
    .unwrap()
});

// Round trip of a full validation, including the decision service call
pub static LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "pep_decision_latency_ms",
        "Access decision latency in milliseconds",
    )
    .buckets(LATENCY_BUCKETS.to_vec());
    register_histogram!(opts).unwrap()
});

pub fn record(outcome: &str, elapsed_ms: f64) {
    DECISIONS.with_label_values(&[outcome]).inc();
    LATENCY.observe(elapsed_ms);
}
