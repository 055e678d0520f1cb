use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CIRCUITS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "circuit_connected",
        "Circuits currently bound to a live connection",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static CIRCUITS_DISCONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "circuit_disconnected",
        "Circuits retained while waiting for a reconnect",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static CIRCUIT_EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "circuit_evictions_total",
            "Entries evicted from retention caches",
        ),
        &["cache", "reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BATCH_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "circuit_batch_events_total",
            "Render batch lifecycle events",
        ),
        &["event"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static STREAM_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "circuit_stream_failures_total",
            "Inbound chunk streams that ended in failure",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CIRCUIT_FAULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("circuit_faults_total", "Faults reported by circuits"),
        &["kind", "fatal"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Renders every registered metric in the prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(target = "circuit_host::metrics", error = %err, "failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
