// ===============================
// src/domain.rs
// ===============================
use ahash::AHashMap as HashMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Harga per symbol yang dipakai satu cycle (diambil sekali saat scan).
pub type PriceSnapshot = HashMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketQuote {
    pub symbol: String,
    pub price: f64,
    pub change_percent: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend { Up, Down, Flat }

impl Trend {
    pub fn label(&self) -> &'static str {
        match self { Trend::Up => "UP", Trend::Down => "DOWN", Trend::Flat => "FLAT" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub symbol: String,
    pub price: f64,
    pub timestamp: i64,
    pub trend: Trend,
    pub volatility: f64,
    pub change_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub symbol: String,
    pub profit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction { Buy, Sell, Hold }

impl TradeAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "BUY" => Some(TradeAction::Buy),
            "SELL" => Some(TradeAction::Sell),
            "HOLD" => Some(TradeAction::Hold),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self { TradeAction::Buy => "BUY", TradeAction::Sell => "SELL", TradeAction::Hold => "HOLD" }
    }
}

/// Aksi yang sudah tervalidasi; qty selalu dalam lembar utuh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Buy { qty: u64 },
    Sell { qty: u64 },
    Hold,
}

impl Decision {
    pub fn action(&self) -> TradeAction {
        match self {
            Decision::Buy { .. } => TradeAction::Buy,
            Decision::Sell { .. } => TradeAction::Sell,
            Decision::Hold => TradeAction::Hold,
        }
    }

    pub fn qty(&self) -> u64 {
        match self { Decision::Buy { qty } | Decision::Sell { qty } => *qty, Decision::Hold => 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDecision {
    pub symbol: String,
    pub decision: Decision,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus { Sent, Filled, Failed }

impl OrderStatus {
    pub fn label(&self) -> &'static str {
        match self { OrderStatus::Sent => "sent", OrderStatus::Filled => "filled", OrderStatus::Failed => "failed" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: u64,
    pub status: OrderStatus,
    pub price: Option<f64>,
    pub error: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub cash: f64,
    pub positions: HashMap<String, u64>,
    pub equity: f64,
    pub initial_balance: f64,
    /// avg cost per lembar, hanya untuk symbol yang masih dipegang
    pub cost_basis: HashMap<String, f64>,
    /// harga terakhir yang diketahui per symbol (mark-to-market)
    pub marks: HashMap<String, f64>,
}

impl PortfolioState {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            cash: initial_balance,
            equity: initial_balance,
            initial_balance,
            ..Default::default()
        }
    }

    pub fn held(&self, symbol: &str) -> u64 {
        self.positions.get(symbol).copied().unwrap_or(0)
    }

    pub fn held_symbols(&self) -> Vec<String> {
        let mut v: Vec<String> = self.positions.keys().cloned().collect();
        v.sort();
        v
    }

    /// Update marks dari snapshot lalu hitung ulang equity = cash + sum(qty * mark).
    pub fn mark_to_market(&mut self, prices: &PriceSnapshot) {
        for sym in self.positions.keys() {
            if let Some(px) = prices.get(sym) {
                self.marks.insert(sym.clone(), *px);
            }
        }
        let holdings: f64 = self
            .positions
            .iter()
            .map(|(sym, qty)| *qty as f64 * self.marks.get(sym).copied().unwrap_or(0.0))
            .sum();
        self.equity = self.cash + holdings;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode { Simulation, Live }

impl TradingMode {
    pub fn label(&self) -> &'static str {
        match self { TradingMode::Simulation => "simulation", TradingMode::Live => "live" }
    }
}

/// Indikator konektivitas yang terlihat user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus { Connected, Error, Simulation }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Quote(MarketQuote),
    Decision(TradeDecision),
    Order(OrderResult),
    ModeChange { from: TradingMode, to: TradingMode, reason: String },
    Note(String),
}
