// ===============================
// src/ledger.rs (portfolio ledger & execution)
// ===============================
//
// Menerapkan keputusan ke portfolio, berurutan sesuai urutan input,
// dengan satu price snapshot yang diambil saat scan (tidak di-fetch ulang).
//
// Simulation:
//   BUY  sukses iff qty*px <= cash  -> cash -= qty*px, posisi += qty, FILLED
//   SELL sukses iff held >= qty     -> cash += qty*px, posisi -= qty (hapus kalau 0), FILLED
//   gagal -> ditolak (LedgerError), portfolio tidak berubah
//   akhir batch: equity = cash + sum(qty*px)
// Live:
//   order market/day via gateway; sukses -> SENT (fill tidak dikonfirmasi sinkron)
//   transient -> FAILED untuk keputusan itu saja, lanjut
//   permanent -> sisa batch dibatalkan, sinyal relay_lost ke orchestrator
//   akhir batch: refresh cash/equity dari akun; gagal -> snapshot lama dipertahankan
//
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::alpaca::{OrderRequest, OrderSide};
use crate::domain::{
    now_ms, Decision, OrderResult, OrderStatus, PortfolioState, PriceSnapshot, TradeAction, TradeDecision,
    TradeOutcome, TradingMode,
};
use crate::gateway::{GatewayError, ResilienceGateway};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("insufficient funds for {symbol}: need {needed:.2}, cash {cash:.2}")]
    InsufficientFunds { symbol: String, needed: f64, cash: f64 },
    #[error("insufficient holdings for {symbol}: want {wanted}, held {held}")]
    InsufficientHoldings { symbol: String, wanted: u64, held: u64 },
    #[error("no price for {symbol} in this cycle's snapshot")]
    NoPrice { symbol: String },
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub portfolio: PortfolioState,
    pub orders: Vec<OrderResult>,
    pub outcomes: Vec<TradeOutcome>,
    pub rejections: Vec<LedgerError>,
    /// relay hilang (permanent) -> orchestrator wajib demote ke simulasi
    pub relay_lost: Option<GatewayError>,
    /// refresh akun gagal (transient); portfolio lama dipakai
    pub refresh_warning: Option<GatewayError>,
    pub refreshed: bool,
}

impl ExecutionReport {
    fn new(portfolio: PortfolioState) -> Self {
        Self { portfolio, ..Default::default() }
    }

    pub fn last_order(&self) -> Option<&OrderResult> {
        self.orders.last()
    }
}

fn order(d: &TradeDecision, status: OrderStatus, price: Option<f64>, error: Option<String>) -> OrderResult {
    OrderResult {
        symbol: d.symbol.clone(),
        action: d.decision.action(),
        quantity: d.decision.qty(),
        status,
        price,
        error,
        timestamp: now_ms(),
    }
}

pub struct ExecutionLedger {
    gateway: Arc<ResilienceGateway>,
}

impl ExecutionLedger {
    pub fn new(gateway: Arc<ResilienceGateway>) -> Self {
        Self { gateway }
    }

    pub async fn execute(
        &self,
        decisions: &[TradeDecision],
        prices: &PriceSnapshot,
        portfolio: PortfolioState,
        mode: TradingMode,
    ) -> ExecutionReport {
        match mode {
            TradingMode::Simulation => apply_simulated(decisions, prices, portfolio),
            TradingMode::Live => self.apply_live(decisions, portfolio).await,
        }
    }

    async fn apply_live(&self, decisions: &[TradeDecision], portfolio: PortfolioState) -> ExecutionReport {
        let mut rep = ExecutionReport::new(portfolio);

        for d in decisions {
            let Some(side) = OrderSide::from_action(d.decision.action()) else { continue };
            let qty = d.decision.qty();
            if qty == 0 {
                debug!(symbol = %d.symbol, "zero quantity, skipped");
                continue;
            }

            let req = OrderRequest::market_day(&d.symbol, qty, side);
            match self.gateway.submit_order(&req).await {
                Ok(_) => rep.orders.push(order(d, OrderStatus::Sent, None, None)),
                Err(e) if e.is_permanent() => {
                    warn!(symbol = %d.symbol, error = %e, "relay lost mid-batch, abandoning remaining orders");
                    rep.relay_lost = Some(e);
                    return rep;
                }
                Err(e) => rep.orders.push(order(d, OrderStatus::Failed, None, Some(e.to_string()))),
            }
        }

        match self.gateway.account().await {
            Ok(b) => {
                rep.portfolio.cash = b.cash;
                rep.portfolio.equity = b.equity;
                rep.refreshed = true;
            }
            Err(e) if e.is_permanent() => rep.relay_lost = Some(e),
            Err(e) => {
                warn!(error = %e, "account refresh failed, keeping previous snapshot");
                rep.refresh_warning = Some(e);
            }
        }
        rep
    }
}

/// Ledger paper: murni, tanpa I/O.
pub fn apply_simulated(decisions: &[TradeDecision], prices: &PriceSnapshot, portfolio: PortfolioState) -> ExecutionReport {
    let mut rep = ExecutionReport::new(portfolio);

    for d in decisions {
        let (action, qty) = match d.decision {
            Decision::Hold => continue,
            Decision::Buy { qty } => (TradeAction::Buy, qty),
            Decision::Sell { qty } => (TradeAction::Sell, qty),
        };
        if qty == 0 {
            continue;
        }
        let Some(&px) = prices.get(&d.symbol) else {
            rep.rejections.push(LedgerError::NoPrice { symbol: d.symbol.clone() });
            continue;
        };
        let p = &mut rep.portfolio;

        match action {
            TradeAction::Buy => {
                let cost = qty as f64 * px;
                if cost > p.cash {
                    rep.rejections.push(LedgerError::InsufficientFunds { symbol: d.symbol.clone(), needed: cost, cash: p.cash });
                    continue;
                }
                let held = p.held(&d.symbol);
                let avg = p.cost_basis.get(&d.symbol).copied().unwrap_or(0.0);
                let new_qty = held + qty;
                p.cash -= cost;
                p.positions.insert(d.symbol.clone(), new_qty);
                p.cost_basis
                    .insert(d.symbol.clone(), (avg * held as f64 + cost) / new_qty as f64);
            }
            TradeAction::Sell => {
                let held = p.held(&d.symbol);
                if held < qty {
                    rep.rejections.push(LedgerError::InsufficientHoldings { symbol: d.symbol.clone(), wanted: qty, held });
                    continue;
                }
                let avg = p.cost_basis.get(&d.symbol).copied().unwrap_or(px);
                p.cash += qty as f64 * px;
                let left = held - qty;
                if left == 0 {
                    p.positions.remove(&d.symbol);
                    p.cost_basis.remove(&d.symbol);
                    p.marks.remove(&d.symbol);
                } else {
                    p.positions.insert(d.symbol.clone(), left);
                }
                rep.outcomes.push(TradeOutcome { symbol: d.symbol.clone(), profit: (px - avg) * qty as f64 });
            }
            TradeAction::Hold => {}
        }
        rep.orders.push(order(d, OrderStatus::Filled, Some(px), None));
    }

    rep.portfolio.mark_to_market(prices);
    rep
}
