// ===============================
// src/posttrade.rs
// ===============================
use tracing::{error, info, warn};

use crate::domain::{OrderResult, OrderStatus, TradingMode};
use crate::ledger::LedgerError;
use crate::metrics::{ORDERS, REJECTIONS};

pub fn report(order: &OrderResult, mode: TradingMode) {
    ORDERS.with_label_values(&[order.status.label(), mode.label()]).inc();
    let action = order.action.label();
    match order.status {
        OrderStatus::Filled => info!(symbol = %order.symbol, action, qty = order.quantity, px = ?order.price, "FILLED"),
        OrderStatus::Sent => info!(symbol = %order.symbol, action, qty = order.quantity, "SENT"),
        OrderStatus::Failed => warn!(
            symbol = %order.symbol,
            action,
            qty = order.quantity,
            reason = order.error.as_deref().unwrap_or("unknown"),
            "FAILED"
        ),
    }
}

pub fn reject(reason: &LedgerError) {
    REJECTIONS.inc();
    error!(%reason, "trade rejected");
}
