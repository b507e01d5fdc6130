// ===============================
// src/main.rs
// ===============================
/*
 # simulasi, satu cycle lalu keluar
 cargo run -- --simulation --once

 # mode aktif & equity
curl -s localhost:9898/metrics | egrep '^(trading_mode|portfolio_equity|portfolio_cash)'

# kesehatan execution API
curl -s localhost:9898/metrics | egrep '^(gateway_calls_total|circuit_breaker_open)'

*/
/*
=============================================================================
Project : tradebrain — autonomous trading control loop in Rust
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Samples market quotes (live / public crypto / simulated walk),
          keeps bounded price memory, asks an external decision model for
          BUY/SELL/HOLD, executes on a paper ledger or through a circuit-
          broken execution relay, exposes Prometheus metrics, and records
          JSONL events.
=============================================================================
*/
mod alpaca;
mod breaker;
mod config;
mod crypto;
mod decision;
mod domain;
mod engine;
mod feed;
mod gateway;          // resilience gateway (relay + circuit breaker)
mod ledger;
mod memory;
mod metrics;
mod posttrade;
mod recorder;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::crypto::CryptoQuotes;
use crate::decision::{DecisionEngine, DecisionError, DecisionModel, DecisionRequest, HttpDecisionModel};
use crate::domain::{Event, PortfolioState};
use crate::engine::{ControlLoop, Reconfigure, RuntimeConfig, Services};
use crate::feed::MarketSampler;
use crate::gateway::ResilienceGateway;
use crate::ledger::ExecutionLedger;
use crate::memory::MemoryStore;

/// Dipakai saat DECISION_URL kosong; trading sudah dimatikan oleh config jadi tidak pernah dipanggil.
struct NoModel;

#[async_trait]
impl DecisionModel for NoModel {
    async fn complete(&self, _req: &DecisionRequest) -> Result<String, DecisionError> {
        Err(DecisionError::Transport("no decision model configured".into()))
    }
}

/// SIGHUP -> baca ulang config (.env / ENV / CLI) dan minta loop ganti mode.
#[cfg(unix)]
async fn watch_reload(tx: mpsc::Sender<Reconfigure>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(?e, "failed to install SIGHUP handler, reconfiguration disabled");
            return;
        }
    };
    while hup.recv().await.is_some() {
        let cfg = config::load();
        info!(mode = cfg.mode.label(), trading_enabled = cfg.trading_enabled, "SIGHUP: reloading configuration");
        let req = Reconfigure { mode: cfg.mode, trading_enabled: cfg.trading_enabled };
        if tx.send(req).await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ---- Config ----
    let cfg = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    info!(
        mode = cfg.mode.label(),
        trading_enabled = cfg.trading_enabled,
        interval = ?cfg.interval,
        batch_size = cfg.batch_size,
        symbols = ?cfg.symbols,
        relay = %cfg.gateway.relay_url,
        decision_model = cfg.decision_url.as_deref().unwrap_or("-"),
        "startup config"
    );

    // ---- Recorder (optional) ----
    let journal = cfg.record_file.clone().map(|path| {
        let (tx, rx) = mpsc::channel::<Event>(8192);
        tokio::spawn(recorder::run(rx, path));
        tx
    });

    // ---- Services ----
    let gateway = match ResilienceGateway::new(cfg.gateway.clone(), cfg.credentials.clone()) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            error!(error = %e, "failed to build execution gateway");
            return;
        }
    };
    let sampler = MarketSampler::new(
        cfg.symbols.clone(),
        gateway.clone(),
        CryptoQuotes::new(&cfg.crypto_quote_url, cfg.gateway.timeout),
        cfg.sim_seed,
        // lebih longgar dari timeout gateway supaya timeout normal tercatat di dalam gateway
        cfg.gateway.timeout + Duration::from_secs(1),
    );
    let model: Box<dyn DecisionModel> = match &cfg.decision_url {
        Some(url) => Box::new(HttpDecisionModel::new(url.clone(), cfg.decision_api_key.clone(), cfg.gateway.timeout * 4)),
        None => Box::new(NoModel),
    };
    let svc = Services {
        sampler,
        memory: MemoryStore::default(),
        decisions: DecisionEngine::new(model),
        ledger: ExecutionLedger::new(gateway.clone()),
        gateway,
    };

    let runtime = RuntimeConfig { mode: cfg.mode, trading_enabled: cfg.trading_enabled, batch_size: cfg.batch_size };
    let mut ctl = ControlLoop::new(runtime, PortfolioState::new(cfg.initial_balance), svc);
    if let Some(tx) = journal {
        ctl = ctl.with_journal(tx);
    }

    // ---- INITIALIZING -> RUNNING ----
    ctl.initialize().await;
    info!(
        mode = ctl.mode().label(),
        phase = ?ctl.phase(),
        status = ?ctl.status(),
        equity = ctl.portfolio().equity,
        "control loop ready"
    );

    if cfg.once {
        ctl.run_cycle().await;
    } else {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(?e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };
        let (reload_tx, reload_rx) = mpsc::channel::<Reconfigure>(4);
        #[cfg(unix)]
        tokio::spawn(watch_reload(reload_tx));
        #[cfg(not(unix))]
        drop(reload_tx);
        ctl = ctl.run(cfg.interval, reload_rx, shutdown).await;
    }

    let p = ctl.portfolio();
    info!(
        cycles = ctl.cycles(),
        mode = ctl.mode().label(),
        phase = ?ctl.phase(),
        last_scan = ctl.last_scan().len(),
        win_rate = ?ctl.memory().win_rate(),
        cash = p.cash,
        equity = p.equity,
        pnl = p.equity - ctl.start_of_day_equity(),
        last_order = ?ctl.last_order().map(|o| (&o.symbol, o.action.label(), o.status.label())),
        "stopped"
    );
}
