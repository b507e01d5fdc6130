// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Control loop --------
pub static CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cycles_total", "control loop cycles (label: outcome = ok|error|panic)"),
        &["outcome"],
    )
    .unwrap()
});

pub static CYCLE_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("cycle_duration_ms", "Wall time of one sample->execute cycle (ms)")
            .buckets(vec![50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0]),
    )
    .unwrap()
});

pub static MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("trading_mode", "1 for the active mode (label: mode)"), &["mode"]).unwrap()
});

// -------- Market / decisions --------
pub static QUOTES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("quotes_total", "market quotes by source"), &["source"]).unwrap()
});

pub static DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("decisions_total", "validated decisions by action"), &["action"]).unwrap()
});

pub static DECISIONS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("decisions_dropped_total", "model decisions dropped by validation").unwrap()
});

// -------- Execution --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_total", "order results (labels: status, mode)"), &["status", "mode"]).unwrap()
});

pub static REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("ledger_rejections_total", "decisions rejected by ledger validation").unwrap()
});

pub static CASH: Lazy<Gauge> = Lazy::new(|| Gauge::new("portfolio_cash", "portfolio cash").unwrap());

pub static EQUITY: Lazy<Gauge> = Lazy::new(|| Gauge::new("portfolio_equity", "portfolio equity").unwrap());

// -------- Execution API health --------
pub static GATEWAY_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("gateway_calls_total", "execution API calls (label: outcome = ok|transient|permanent|short_circuit)"),
        &["outcome"],
    )
    .unwrap()
});

pub static BREAKER_OPEN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("circuit_breaker_open", "1 if execution API breaker is open").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(CYCLES.clone())),
        REGISTRY.register(Box::new(CYCLE_LATENCY.clone())),
        REGISTRY.register(Box::new(MODE.clone())),
        REGISTRY.register(Box::new(QUOTES.clone())),
        REGISTRY.register(Box::new(DECISIONS.clone())),
        REGISTRY.register(Box::new(DECISIONS_DROPPED.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(REJECTIONS.clone())),
        REGISTRY.register(Box::new(CASH.clone())),
        REGISTRY.register(Box::new(EQUITY.clone())),
        REGISTRY.register(Box::new(GATEWAY_CALLS.clone())),
        REGISTRY.register(Box::new(BREAKER_OPEN.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let body = encode_metrics();
    let rsp = Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("# encode error\n")));
    Ok(rsp)
}

// Serve GET / dan /metrics di port terpisah
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });

    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!("metrics listening on http://{addr}/ (and /metrics)");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        init();
        CYCLES.with_label_values(&["ok"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("cycles_total"));
    }
}
