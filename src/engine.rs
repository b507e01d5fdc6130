// ===============================
// src/engine.rs (control loop)
// ===============================
//
// Satu cycle = sample -> memorize -> (kalau trading on) screen -> context -> decide
//              -> execute -> reconcile.
//
// - Cycle tidak pernah overlap: cycle berikut baru mulai setelah cycle sebelumnya selesai.
// - Loop tidak pernah berhenti karena error: semua error (dan panic) ditangkap di level cycle.
// - Tiap cycle memakai snapshot config + portfolio di awal, commit di akhir.
// - Permanent failure saat LIVE -> demote ke SIMULATION, tidak naik sendiri;
//   kembali ke LIVE hanya lewat `reconfigure`.
//
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::decision::DecisionEngine;
use crate::domain::{
    ConnectionStatus, Decision, Event, MarketQuote, OrderResult, PortfolioState, PriceSnapshot, TradeDecision,
    TradingMode,
};
use crate::feed::MarketSampler;
use crate::gateway::{GatewayError, ResilienceGateway};
use crate::ledger::ExecutionLedger;
use crate::memory::MemoryStore;
use crate::metrics::{CASH, CYCLES, CYCLE_LATENCY, EQUITY, MODE};
use crate::posttrade;

/// Ambang gerak minimum (persen) supaya quote jadi kandidat.
pub const CANDIDATE_MIN_CHANGE_PCT: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Initializing,
    Running,
    /// Running, tapi sudah didemote dari LIVE ke SIMULATION
    Degraded,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("execution relay lost: {0}")]
    RelayLost(#[from] GatewayError),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mode: TradingMode,
    pub trading_enabled: bool,
    pub batch_size: usize,
}

/// Permintaan ganti mode dari luar loop (mis. SIGHUP -> reload config).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconfigure {
    pub mode: TradingMode,
    pub trading_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub mode: TradingMode,
    pub quotes: usize,
    pub candidates: usize,
    pub decisions: usize,
    pub orders: Vec<OrderResult>,
    pub rejections: usize,
    pub cash: f64,
    pub equity: f64,
}

pub struct Services {
    pub sampler: MarketSampler,
    pub memory: MemoryStore,
    pub decisions: DecisionEngine,
    pub ledger: ExecutionLedger,
    pub gateway: Arc<ResilienceGateway>,
}

/// Quote jadi kandidat kalau |change%| > 0.05 atau symbol sedang dipegang.
pub fn screen_candidates(quotes: &[MarketQuote], portfolio: &PortfolioState) -> Vec<MarketQuote> {
    quotes
        .iter()
        .filter(|q| q.change_percent.abs() > CANDIDATE_MIN_CHANGE_PCT || portfolio.held(&q.symbol) > 0)
        .cloned()
        .collect()
}

pub struct ControlLoop {
    cfg: RuntimeConfig,
    phase: LoopPhase,
    status: ConnectionStatus,
    portfolio: PortfolioState,
    start_of_day_equity: f64,
    last_order: Option<OrderResult>,
    last_scan: Vec<MarketQuote>,
    cycles: u64,
    svc: Services,
    journal: Option<mpsc::Sender<Event>>,
}

impl ControlLoop {
    pub fn new(cfg: RuntimeConfig, portfolio: PortfolioState, svc: Services) -> Self {
        let status = match cfg.mode {
            TradingMode::Simulation => ConnectionStatus::Simulation,
            TradingMode::Live => ConnectionStatus::Error,
        };
        Self {
            start_of_day_equity: portfolio.equity,
            cfg,
            phase: LoopPhase::Initializing,
            status,
            portfolio,
            last_order: None,
            last_scan: Vec::new(),
            cycles: 0,
            svc,
            journal: None,
        }
    }

    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    pub fn mode(&self) -> TradingMode {
        self.cfg.mode
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn portfolio(&self) -> &PortfolioState {
        &self.portfolio
    }

    pub fn last_order(&self) -> Option<&OrderResult> {
        self.last_order.as_ref()
    }

    pub fn last_scan(&self) -> &[MarketQuote] {
        &self.last_scan
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.svc.memory
    }

    pub fn start_of_day_equity(&self) -> f64 {
        self.start_of_day_equity
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn note(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(ev);
        }
    }

    fn publish_state(&self) {
        for m in [TradingMode::Simulation, TradingMode::Live] {
            MODE.with_label_values(&[m.label()]).set((m == self.cfg.mode) as i64);
        }
        CASH.set(self.portfolio.cash);
        EQUITY.set(self.portfolio.equity);
    }

    /// INITIALIZING -> RUNNING. Di LIVE, sync akun sekali (cash, equity, initial balance).
    pub async fn initialize(&mut self) {
        if self.cfg.mode == TradingMode::Live {
            match self.svc.gateway.account().await {
                Ok(b) => {
                    self.portfolio = PortfolioState {
                        cash: b.cash,
                        equity: b.equity,
                        initial_balance: b.equity,
                        ..Default::default()
                    };
                    self.start_of_day_equity = b.equity;
                    self.status = ConnectionStatus::Connected;
                    info!(equity = b.equity, cash = b.cash, buying_power = ?b.buying_power, "connected to execution account");
                }
                Err(e) if e.is_permanent() => self.demote(&format!("execution relay not detected: {e}")),
                Err(e) => {
                    error!(error = %e, "failed to connect to execution account");
                    self.status = ConnectionStatus::Error;
                }
            }
        } else {
            self.status = ConnectionStatus::Simulation;
        }
        if self.phase == LoopPhase::Initializing {
            self.phase = LoopPhase::Running;
        }
        self.publish_state();
    }

    /// Satu-satunya jalan kembali ke LIVE setelah demote.
    pub async fn reconfigure(&mut self, mode: TradingMode, trading_enabled: bool) {
        if mode == TradingMode::Live && !self.svc.gateway.has_credentials() {
            warn!("live mode requested without credentials, staying in simulation");
            self.cfg.trading_enabled = trading_enabled;
            return;
        }
        if mode != self.cfg.mode {
            info!(from = self.cfg.mode.label(), to = mode.label(), "reconfigured trading mode");
            self.note(Event::ModeChange { from: self.cfg.mode, to: mode, reason: "reconfigured".into() });
        }
        self.cfg.mode = mode;
        self.cfg.trading_enabled = trading_enabled;
        self.phase = LoopPhase::Initializing;
        self.initialize().await;
    }

    fn demote(&mut self, reason: &str) {
        if self.cfg.mode == TradingMode::Live {
            warn!(%reason, "switching to simulation mode");
            self.note(Event::ModeChange { from: TradingMode::Live, to: TradingMode::Simulation, reason: reason.to_string() });
            self.cfg.mode = TradingMode::Simulation;
            self.phase = LoopPhase::Degraded;
        }
        self.status = ConnectionStatus::Simulation;
        self.publish_state();
    }

    /// Jalankan satu cycle. Tidak pernah gagal ke caller: error di-log dan cycle selesai.
    pub async fn run_cycle(&mut self) -> Option<CycleSummary> {
        self.cycles += 1;
        let started = Instant::now();
        let res = self.try_cycle().await;
        CYCLE_LATENCY.observe(started.elapsed().as_secs_f64() * 1_000.0);

        match res {
            Ok(s) => {
                CYCLES.with_label_values(&["ok"]).inc();
                info!(
                    cycle = self.cycles,
                    mode = s.mode.label(),
                    quotes = s.quotes,
                    candidates = s.candidates,
                    decisions = s.decisions,
                    orders = s.orders.len(),
                    rejections = s.rejections,
                    cash = s.cash,
                    equity = s.equity,
                    "cycle complete"
                );
                Some(s)
            }
            Err(CycleError::RelayLost(e)) => {
                CYCLES.with_label_values(&["error"]).inc();
                self.demote(&format!("relay connection lost during cycle: {e}"));
                None
            }
        }
    }

    async fn try_cycle(&mut self) -> Result<CycleSummary, CycleError> {
        // snapshot di awal cycle
        let cfg = self.cfg.clone();
        let mut portfolio = self.portfolio.clone();
        let live = cfg.mode == TradingMode::Live;

        // 1) SCAN
        let held = portfolio.held_symbols();
        let quotes = self.svc.sampler.scan_batch(cfg.batch_size, &held, live).await?;
        let prices: PriceSnapshot = quotes.iter().map(|q| (q.symbol.clone(), q.price)).collect();

        // 2) MEMORIZE
        for q in &quotes {
            self.svc.memory.record(q);
            self.note(Event::Quote(q.clone()));
        }
        self.last_scan = quotes.clone();

        let mut summary = CycleSummary {
            mode: cfg.mode,
            quotes: quotes.len(),
            candidates: 0,
            decisions: 0,
            orders: Vec::new(),
            rejections: 0,
            cash: portfolio.cash,
            equity: portfolio.equity,
        };

        // 3) BRAIN + EXECUTE
        let mut relay_lost = None;
        if cfg.trading_enabled {
            let candidates = screen_candidates(&quotes, &portfolio);
            summary.candidates = candidates.len();

            if !candidates.is_empty() {
                let symbols: Vec<String> = candidates.iter().map(|c| c.symbol.clone()).collect();
                let market_ctx = self.svc.memory.batch_context(&symbols);
                let learning_ctx = self.svc.memory.learning_context();
                info!(candidates = candidates.len(), "analyzing candidates");

                let batch = self.svc.decisions.decide(&candidates, &market_ctx, &learning_ctx, &portfolio).await;
                let actionable: Vec<TradeDecision> =
                    batch.decisions.into_iter().filter(|d| d.decision != Decision::Hold).collect();
                summary.decisions = actionable.len();
                for d in &actionable {
                    self.note(Event::Decision(d.clone()));
                }

                if !actionable.is_empty() {
                    let rep = self.svc.ledger.execute(&actionable, &prices, portfolio, cfg.mode).await;
                    for r in &rep.rejections {
                        posttrade::reject(r);
                    }
                    for o in &rep.orders {
                        posttrade::report(o, cfg.mode);
                        self.note(Event::Order(o.clone()));
                    }
                    if let Some(o) = rep.last_order() {
                        self.last_order = Some(o.clone());
                    }
                    for out in &rep.outcomes {
                        self.svc.memory.record_outcome(out.clone());
                    }
                    if live {
                        if rep.refreshed {
                            self.status = ConnectionStatus::Connected;
                        } else if rep.refresh_warning.is_some() {
                            self.status = ConnectionStatus::Error;
                        }
                    }
                    summary.rejections = rep.rejections.len();
                    summary.orders = rep.orders;
                    relay_lost = rep.relay_lost;
                    portfolio = rep.portfolio;
                }
            }
        }

        // 4) RECONCILE: di simulasi equity selalu dihitung ulang dari snapshot
        if !live {
            portfolio.mark_to_market(&prices);
        }
        summary.cash = portfolio.cash;
        summary.equity = portfolio.equity;

        // commit
        self.portfolio = portfolio;
        self.publish_state();

        match relay_lost {
            Some(e) => Err(CycleError::RelayLost(e)),
            None => Ok(summary),
        }
    }

    /// Loop utama: satu cycle per tick, tanpa overlap, sampai `shutdown` selesai.
    /// Shutdown dan `reload` hanya diproses di antara tick.
    pub async fn run<S>(mut self, interval: Duration, mut reload: mpsc::Receiver<Reconfigure>, shutdown: S) -> Self
    where
        S: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(cycles = self.cycles, "shutdown requested, stopping control loop");
                    break;
                }
                Some(req) = reload.recv() => {
                    self.reconfigure(req.mode, req.trading_enabled).await;
                }
                _ = ticker.tick() => {
                    if AssertUnwindSafe(self.run_cycle()).catch_unwind().await.is_err() {
                        CYCLES.with_label_values(&["panic"]).inc();
                        error!(cycle = self.cycles, "cycle crashed, auto-recovering at next tick");
                    }
                }
            }
        }
        self
    }
}
