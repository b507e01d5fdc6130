// ===============================
// src/memory.rs
// ===============================
//
// Memori historis terbatas:
// - per symbol: window FIFO MemoryRecord (default 20)
// - log hasil trade: window FIFO TradeOutcome (default 50)
// Dipakai untuk menyusun konteks teks buat decision model.
//
use std::collections::VecDeque;
use std::fmt::Write as _;

use ahash::AHashMap as HashMap;

use crate::domain::{MarketQuote, MemoryRecord, TradeOutcome, Trend};

pub const HISTORY_CAPACITY: usize = 20;
pub const OUTCOME_CAPACITY: usize = 50;
pub const VOLATILITY_WINDOW: usize = 10;
pub const CONTEXT_PATH_LEN: usize = 5;
pub const NO_LEARNING_DATA: &str = "No trade history yet. No learned patterns available.";

/// Population std-dev.
pub fn population_std_dev(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    var.sqrt()
}

pub struct MemoryStore {
    history: HashMap<String, VecDeque<MemoryRecord>>,
    outcomes: VecDeque<TradeOutcome>,
    history_capacity: usize,
    outcome_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY, OUTCOME_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new(history_capacity: usize, outcome_capacity: usize) -> Self {
        Self {
            history: HashMap::new(),
            outcomes: VecDeque::with_capacity(outcome_capacity),
            history_capacity: history_capacity.max(1),
            outcome_capacity: outcome_capacity.max(1),
        }
    }

    pub fn history(&self, symbol: &str) -> Option<&VecDeque<MemoryRecord>> {
        self.history.get(symbol)
    }

    pub fn outcomes(&self) -> &VecDeque<TradeOutcome> {
        &self.outcomes
    }

    pub fn record(&mut self, quote: &MarketQuote) -> &MemoryRecord {
        let window = self
            .history
            .entry(quote.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.history_capacity));

        let trend = match window.back() {
            Some(prev) if quote.price > prev.price => Trend::Up,
            Some(prev) if quote.price < prev.price => Trend::Down,
            _ => Trend::Flat,
        };

        // trailing 10 harga termasuk harga sekarang
        let mut trailing: Vec<f64> = window
            .iter()
            .rev()
            .take(VOLATILITY_WINDOW - 1)
            .map(|r| r.price)
            .collect();
        trailing.push(quote.price);
        let volatility = population_std_dev(&trailing);

        window.push_back(MemoryRecord {
            symbol: quote.symbol.clone(),
            price: quote.price,
            timestamp: quote.timestamp,
            trend,
            volatility,
            change_percent: quote.change_percent,
        });
        while window.len() > self.history_capacity {
            window.pop_front();
        }
        // window tidak pernah kosong setelah push_back
        &window[window.len() - 1]
    }

    pub fn record_outcome(&mut self, outcome: TradeOutcome) {
        self.outcomes.push_back(outcome);
        while self.outcomes.len() > self.outcome_capacity {
            self.outcomes.pop_front();
        }
    }

    /// Snapshot pasar per symbol: harga, path 5 terakhir, rata-rata volatilitas path, change%, trend.
    pub fn batch_context(&self, symbols: &[String]) -> String {
        let mut out = String::from("MARKET SNAPSHOTS (MEMORY):\n");
        for sym in symbols {
            let Some(window) = self.history.get(sym) else { continue };
            let Some(last) = window.back() else { continue };

            let path: Vec<&MemoryRecord> = window.iter().skip(window.len().saturating_sub(CONTEXT_PATH_LEN)).collect();
            let path_str = path.iter().map(|r| format!("{:.2}", r.price)).collect::<Vec<_>>().join(" -> ");
            let avg_vol = path.iter().map(|r| r.volatility).sum::<f64>() / path.len() as f64;

            let _ = writeln!(
                out,
                "- {sym}: Price {:.2}. Recent Path [{path_str}]. Avg Volatility {:.4}. Change {:.4}%. Trend {}.",
                last.price,
                avg_vol,
                last.change_percent,
                last.trend.label(),
            );
        }
        out
    }

    pub fn win_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let wins = self.outcomes.iter().filter(|o| o.profit > 0.0).count();
        Some(wins as f64 / self.outcomes.len() as f64)
    }

    pub fn learning_context(&self) -> String {
        let Some(rate) = self.win_rate() else {
            return NO_LEARNING_DATA.to_string();
        };
        let fmt = |o: &TradeOutcome| format!("{} ({:+.2})", o.symbol, o.profit);
        let recent_wins: Vec<String> = self.outcomes.iter().rev().filter(|o| o.profit > 0.0).take(3).map(fmt).collect();
        let recent_losses: Vec<String> = self.outcomes.iter().rev().filter(|o| o.profit < 0.0).take(3).map(fmt).collect();

        let none = || "none".to_string();
        format!(
            "LEARNING CONTEXT:\nWin rate: {:.1}% over {} trades.\nRecent wins: {}.\nRecent losses: {}.\n",
            rate * 100.0,
            self.outcomes.len(),
            if recent_wins.is_empty() { none() } else { recent_wins.join(", ") },
            if recent_losses.is_empty() { none() } else { recent_losses.join(", ") },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(symbol: &str, price: f64, ts: i64) -> MarketQuote {
        MarketQuote { symbol: symbol.into(), price, change_percent: 0.1, timestamp: ts }
    }

    #[test]
    fn trend_compares_previous_price() {
        let mut m = MemoryStore::default();
        assert_eq!(m.record(&q("A", 10.0, 1)).trend, Trend::Flat);
        assert_eq!(m.record(&q("A", 11.0, 2)).trend, Trend::Up);
        assert_eq!(m.record(&q("A", 11.0, 3)).trend, Trend::Flat);
        assert_eq!(m.record(&q("A", 9.0, 4)).trend, Trend::Down);
        // symbol lain punya window sendiri
        assert_eq!(m.record(&q("B", 1.0, 5)).trend, Trend::Flat);
    }

    #[test]
    fn volatility_uses_trailing_ten_prices() {
        let mut m = MemoryStore::default();
        assert_eq!(m.record(&q("A", 5.0, 0)).volatility, 0.0);
        for i in 1..15 {
            m.record(&q("A", i as f64, i));
        }
        let last = m.history("A").unwrap().back().unwrap().clone();
        let expected: Vec<f64> = (5..15).map(|i| i as f64).collect();
        assert!((last.volatility - population_std_dev(&expected)).abs() < 1e-12);
        // 10 bilangan berurutan -> std-dev populasi sqrt(8.25)
        assert!((last.volatility - 8.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn history_window_is_bounded_fifo() {
        let mut m = MemoryStore::default();
        for i in 0..45 {
            m.record(&q("A", 100.0 + i as f64, i));
            assert!(m.history("A").unwrap().len() <= HISTORY_CAPACITY);
        }
        let w = m.history("A").unwrap();
        assert_eq!(w.len(), HISTORY_CAPACITY);
        assert_eq!(w.front().unwrap().timestamp, 25);
        assert_eq!(w.back().unwrap().timestamp, 44);
    }

    #[test]
    fn outcome_log_is_bounded_fifo() {
        let mut m = MemoryStore::default();
        for i in 0..60 {
            m.record_outcome(TradeOutcome { symbol: format!("S{i}"), profit: 1.0 });
        }
        assert_eq!(m.outcomes().len(), OUTCOME_CAPACITY);
        assert_eq!(m.outcomes().front().unwrap().symbol, "S10");
    }

    #[test]
    fn batch_context_lists_known_symbols_only() {
        let mut m = MemoryStore::default();
        for (i, p) in [10.0, 11.0, 12.0, 13.0, 14.0, 15.0].iter().enumerate() {
            m.record(&q("AAPL", *p, i as i64));
        }
        let ctx = m.batch_context(&["AAPL".to_string(), "UNKNOWN".to_string()]);
        assert!(ctx.contains("- AAPL: Price 15.00"));
        assert!(ctx.contains("[11.00 -> 12.00 -> 13.00 -> 14.00 -> 15.00]"));
        assert!(ctx.contains("Trend UP"));
        assert!(!ctx.contains("UNKNOWN"));
    }

    #[test]
    fn learning_context_summarises_outcomes() {
        let mut m = MemoryStore::default();
        assert_eq!(m.learning_context(), NO_LEARNING_DATA);

        m.record_outcome(TradeOutcome { symbol: "A".into(), profit: 50.0 });
        m.record_outcome(TradeOutcome { symbol: "B".into(), profit: -20.0 });
        m.record_outcome(TradeOutcome { symbol: "C".into(), profit: 5.0 });
        m.record_outcome(TradeOutcome { symbol: "D".into(), profit: 0.0 });

        assert_eq!(m.win_rate(), Some(0.5));
        let ctx = m.learning_context();
        assert!(ctx.contains("Win rate: 50.0% over 4 trades."));
        assert!(ctx.contains("Recent wins: C (+5.00), A (+50.00)."));
        assert!(ctx.contains("Recent losses: B (-20.00)."));
    }
}
