// ===============================
// src/alpaca.rs
// ===============================
//
// Model wire minimal untuk execution API (dilewatkan via relay).
// Semua angka akun dikirim sebagai decimal string.
//
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::TradeAction;

pub const ACCOUNT_PATH: &str = "/v2/account";
pub const ORDERS_PATH: &str = "/v2/orders";

pub fn quote_path(symbol: &str) -> String {
    format!("/v2/stocks/{}/quotes/latest?feed=iex", urlencoding::encode(symbol))
}

/// Envelope yang diterima relay: {targetPath, method, headers, body}
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest<'a> {
    pub target_path: &'a str,
    pub method: &'a str,
    pub headers: RelayHeaders<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RelayHeaders<'a> {
    #[serde(rename = "APCA-API-KEY-ID")]
    pub key_id: &'a str,
    #[serde(rename = "APCA-API-SECRET-KEY")]
    pub secret: &'a str,
    #[serde(rename = "Content-Type")]
    pub content_type: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    pub equity: String,
    pub cash: String,
    #[serde(default)]
    pub buying_power: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountBalances {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: Option<f64>,
}

impl AccountResponse {
    pub fn balances(&self) -> Option<AccountBalances> {
        let equity = self.equity.trim().parse::<f64>().ok().filter(|x| x.is_finite())?;
        let cash = self.cash.trim().parse::<f64>().ok().filter(|x| x.is_finite())?;
        let buying_power = self
            .buying_power
            .as_deref()
            .and_then(|s| s.trim().parse::<f64>().ok());
        Some(AccountBalances { equity, cash, buying_power })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide { Buy, Sell }

impl OrderSide {
    pub fn from_action(action: TradeAction) -> Option<Self> {
        match action {
            TradeAction::Buy => Some(OrderSide::Buy),
            TradeAction::Sell => Some(OrderSide::Sell),
            TradeAction::Hold => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: u64,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub time_in_force: &'static str,
}

impl OrderRequest {
    pub fn market_day(symbol: &str, qty: u64, side: OrderSide) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty,
            side,
            order_type: "market",
            time_in_force: "day",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteResponse {
    #[serde(default)]
    pub quote: Option<Quote>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Quote {
    #[serde(default)]
    pub ap: Option<f64>, // ask
    #[serde(default)]
    pub bp: Option<f64>, // bid
}

impl QuoteResponse {
    /// ask kalau ada, kalau tidak bid. Nilai <= 0 dianggap kosong.
    pub fn best_price(&self) -> Option<f64> {
        let q = self.quote.as_ref()?;
        let valid = |p: Option<f64>| p.filter(|x| x.is_finite() && *x > 0.0);
        valid(q.ap).or_else(|| valid(q.bp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn best_price_prefers_ask_then_bid() {
        let q: QuoteResponse = serde_json::from_value(json!({"quote": {"ap": 101.5, "bp": 101.2}})).unwrap();
        assert_eq!(q.best_price(), Some(101.5));
        let q: QuoteResponse = serde_json::from_value(json!({"quote": {"ap": 0.0, "bp": 99.0}})).unwrap();
        assert_eq!(q.best_price(), Some(99.0));
        let q: QuoteResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(q.best_price(), None);
    }

    #[test]
    fn account_decimal_strings_parse() {
        let a: AccountResponse = serde_json::from_value(json!({
            "equity": "100250.75", "cash": "98000.10", "buying_power": "196000.20", "currency": "USD"
        }))
        .unwrap();
        let b = a.balances().unwrap();
        assert_eq!(b.equity, 100250.75);
        assert_eq!(b.cash, 98000.10);
        assert_eq!(b.buying_power, Some(196000.20));
    }

    #[test]
    fn order_request_wire_shape() {
        let o = OrderRequest::market_day("AAPL", 3, OrderSide::Sell);
        let v = serde_json::to_value(&o).unwrap();
        assert_eq!(v, json!({"symbol": "AAPL", "qty": 3, "side": "sell", "type": "market", "time_in_force": "day"}));
    }
}
