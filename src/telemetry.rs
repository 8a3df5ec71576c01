//! Structured logging bootstrap and the non-blocking counter/histogram sink
//! (component C3). Every other component logs through `tracing` directly;
//! this module only owns process-wide setup and the process-wide
//! `prometheus` registry.

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use tracing_subscriber::EnvFilter;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CONNECTIONS_OPENED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("connections_opened_total", "WebSocket connections accepted").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONNECTIONS_CURRENT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("connections_current", "WebSocket connections currently open").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static MESSAGES_DISPATCHED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("messages_dispatched_total", "Inbound envelopes routed by the dispatcher").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static FILTER_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("filter_rejections_total", "Security pipeline stage rejections").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BROKER_QUEUE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("broker_queue_size", "Approximate outstanding fan-out deliveries").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static DISPATCH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "dispatch_latency_seconds",
        "Time spent routing one inbound envelope",
    ))
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

/// Initialize the global tracing subscriber. Call once from `main`.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
