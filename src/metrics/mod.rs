use std::sync::OnceLock;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use rand::rngs::OsRng;
use rand::RngCore;

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Cache,
    Direct,
    Ping,
}

impl Delivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Cache => "cache",
            Delivery::Direct => "direct",
            Delivery::Ping => "ping",
        }
    }
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn register<M: prometheus::core::Collector + Clone + 'static>(metric: M) -> M {
    if let Err(err) = registry().register(Box::new(metric.clone())) {
        log::warn!("register metric failed: {err}");
    }
    metric
}

fn requests_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("videocache_requests_total", "Served requests by delivery path"),
            &["kind", "code"],
        )
        .expect("requests metric");
        register(counter)
    })
}

fn origin_bytes_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("videocache_origin_bytes_total", "Bytes read from origin servers")
            .expect("origin bytes metric");
        register(counter)
    })
}

fn source_errors_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("videocache_source_errors_total", "Failed reads from origin servers")
            .expect("source errors metric");
        register(counter)
    })
}

fn evicted_files_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("videocache_evicted_files_total", "Cache files removed by the disk policy")
            .expect("evicted files metric");
        register(counter)
    })
}

fn active_clients() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGauge::new("videocache_active_clients", "Sockets currently being served")
            .expect("active clients metric");
        register(gauge)
    })
}

fn init_metrics() {
    for kind in [Delivery::Cache, Delivery::Direct, Delivery::Ping] {
        for code in ["200", "206"] {
            requests_total().with_label_values(&[kind.as_str(), code]).inc_by(0);
        }
    }
    let _ = origin_bytes_total();
    let _ = source_errors_total();
    let _ = evicted_files_total();
    let _ = active_clients();
}

pub fn record_request(kind: Delivery, status: u16) {
    let code = status.to_string();
    requests_total().with_label_values(&[kind.as_str(), code.as_str()]).inc();
}

pub fn record_origin_bytes(n: usize) {
    origin_bytes_total().inc_by(n as u64);
}

pub fn record_source_error() {
    source_errors_total().inc();
}

pub fn record_evicted() {
    evicted_files_total().inc();
}

pub fn client_attached() {
    active_clients().inc();
}

pub fn client_detached() {
    active_clients().dec();
}

pub fn render() -> String {
    init_metrics();
    let families = registry().gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}

pub fn generate_request_id() -> String {
    let mut buf = [0u8; 8];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
