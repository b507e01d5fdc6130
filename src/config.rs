// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : tradebrain — autonomous trading control loop in Rust
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Samples market quotes (live / public crypto / simulated walk),
          keeps bounded price memory, asks an external decision model for
          BUY/SELL/HOLD, executes on a paper ledger or through a circuit-
          broken execution relay, exposes Prometheus metrics, and records
          JSONL events.
=============================================================================
*/
use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use tracing::warn;

use crate::crypto;
use crate::domain::TradingMode;
use crate::gateway::{Credentials, GatewayConfig};

pub const DEFAULT_SYMBOLS: &[&str] = &[
    "SPY", "QQQ", "AAPL", "MSFT", "NVDA", "TSLA", "AMZN", "GOOGL", "META", "AMD", "NFLX", "JPM",
    "BTC/USD", "ETH/USD", "SOL/USD",
];

/// Override dari command line (di atas .env / ENV).
#[derive(Debug, Default, Parser)]
#[command(name = "tradebrain", version, about = "Autonomous trading control loop")]
pub struct Cli {
    /// Paksa mode live (butuh ALPACA_KEY/ALPACA_SECRET)
    #[arg(long, conflicts_with = "simulation")]
    pub live: bool,
    /// Paksa mode simulasi
    #[arg(long)]
    pub simulation: bool,
    /// Interval cycle (detik)
    #[arg(long)]
    pub interval: Option<u64>,
    /// Scan & memorize saja, tanpa decision/eksekusi
    #[arg(long)]
    pub no_trading: bool,
    /// Inisialisasi + satu cycle lalu keluar
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: TradingMode,
    pub trading_enabled: bool,
    pub interval: Duration,
    pub batch_size: usize,
    pub symbols: Vec<String>,
    pub credentials: Option<Credentials>,
    pub gateway: GatewayConfig,
    pub decision_url: Option<String>,
    pub decision_api_key: Option<String>,
    pub crypto_quote_url: String,
    pub initial_balance: f64,
    pub sim_seed: Option<u64>,
    pub record_file: Option<String>,
    pub metrics_port: u16,
    pub once: bool,
}

pub fn parse_mode(s: &str) -> Option<TradingMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "simulation" | "sim" | "paper_sim" => Some(TradingMode::Simulation),
        "live" | "paper" => Some(TradingMode::Live),
        _ => None,
    }
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// SYMBOLS=AAPL,msft,BTC/USD -> uppercase, trimmed, tanpa duplikat
pub fn parse_symbols(s: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for sym in s.split(',').map(|x| x.trim().to_ascii_uppercase()).filter(|x| !x.is_empty()) {
        if !out.contains(&sym) {
            out.push(sym);
        }
    }
    out
}

impl Config {
    /// Bangun config dari fungsi lookup (ENV di produksi, map di test).
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr, F: Fn(&str) -> Option<String>>(get: &F, key: &str, default: T) -> T {
            get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }
        let non_empty = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mode = get("TRADING_MODE").as_deref().and_then(parse_mode).unwrap_or(TradingMode::Simulation);
        let trading_enabled = get("TRADING_ENABLED").as_deref().and_then(parse_bool).unwrap_or(true);

        let symbols = get("SYMBOLS")
            .map(|s| parse_symbols(&s))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect());

        let credentials = match (non_empty("ALPACA_KEY"), non_empty("ALPACA_SECRET")) {
            (Some(key_id), Some(secret)) => Some(Credentials { key_id, secret }),
            _ => None,
        };

        let defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            relay_url: non_empty("RELAY_URL").unwrap_or(defaults.relay_url),
            timeout: Duration::from_millis(parsed(&get, "REQUEST_TIMEOUT_MS", 8_000u64).max(1)),
            failure_threshold: parsed(&get, "BREAKER_THRESHOLD", defaults.failure_threshold).max(1),
            backoff: Duration::from_secs(parsed(&get, "BREAKER_BACKOFF_SECS", 60u64)),
        };

        Config {
            mode,
            trading_enabled,
            interval: Duration::from_secs(parsed(&get, "INTERVAL_SECONDS", 60u64).max(1)),
            batch_size: parsed(&get, "SCAN_BATCH_SIZE", 10usize),
            symbols,
            credentials,
            gateway,
            decision_url: non_empty("DECISION_URL"),
            decision_api_key: non_empty("DECISION_API_KEY"),
            crypto_quote_url: non_empty("CRYPTO_QUOTE_URL").unwrap_or_else(|| crypto::DEFAULT_BASE_URL.to_string()),
            initial_balance: parsed(&get, "INITIAL_BALANCE", 100_000.0f64).max(0.0),
            sim_seed: get("SIM_SEED").and_then(|v| v.trim().parse().ok()),
            record_file: non_empty("RECORD_FILE"),
            metrics_port: parsed(&get, "METRICS_PORT", 9898u16),
            once: false,
        }
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if cli.live {
            self.mode = TradingMode::Live;
        }
        if cli.simulation {
            self.mode = TradingMode::Simulation;
        }
        if let Some(secs) = cli.interval {
            self.interval = Duration::from_secs(secs.max(1));
        }
        if cli.no_trading {
            self.trading_enabled = false;
        }
        self.once = cli.once;
    }

    /// Aturan turunan: live tanpa credentials -> simulasi; tanpa decision model -> trading off.
    pub fn finalize(mut self) -> Self {
        if self.mode == TradingMode::Live && self.credentials.is_none() {
            warn!("TRADING_MODE=live but ALPACA_KEY/ALPACA_SECRET missing, falling back to simulation");
            self.mode = TradingMode::Simulation;
        }
        if self.trading_enabled && self.decision_url.is_none() {
            warn!("DECISION_URL not set, trading disabled (scan & memorize only)");
            self.trading_enabled = false;
        }
        self
    }
}

pub fn load() -> Config {
    // Pastikan .env dibaca
    let _ = dotenv();
    let mut cfg = Config::from_lookup(|k| env::var(k).ok());
    cfg.apply_cli(&Cli::parse());
    cfg.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap as HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = Config::from_lookup(lookup(&[]));
        assert_eq!(cfg.mode, TradingMode::Simulation);
        assert!(cfg.trading_enabled);
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.gateway.timeout, Duration::from_secs(8));
        assert_eq!(cfg.gateway.failure_threshold, 3);
        assert_eq!(cfg.gateway.backoff, Duration::from_secs(60));
        assert_eq!(cfg.initial_balance, 100_000.0);
        assert!(cfg.credentials.is_none());
        assert_eq!(cfg.symbols.len(), DEFAULT_SYMBOLS.len());
    }

    #[test]
    fn reads_values_and_ignores_garbage_numbers() {
        let cfg = Config::from_lookup(lookup(&[
            ("TRADING_MODE", "LIVE"),
            ("TRADING_ENABLED", "off"),
            ("INTERVAL_SECONDS", "abc"),
            ("SYMBOLS", " aapl, msft ,aapl,,btc/usd"),
            ("ALPACA_KEY", "k"),
            ("ALPACA_SECRET", "s"),
            ("SIM_SEED", "99"),
        ]));
        assert_eq!(cfg.mode, TradingMode::Live);
        assert!(!cfg.trading_enabled);
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.symbols, vec!["AAPL", "MSFT", "BTC/USD"]);
        assert!(cfg.credentials.is_some());
        assert_eq!(cfg.sim_seed, Some(99));
    }

    #[test]
    fn live_without_credentials_is_downgraded() {
        let cfg = Config::from_lookup(lookup(&[("TRADING_MODE", "live"), ("ALPACA_KEY", "only-key")])).finalize();
        assert_eq!(cfg.mode, TradingMode::Simulation);
        assert!(!cfg.trading_enabled, "no DECISION_URL -> trading off");
    }

    #[test]
    fn cli_overrides_environment() {
        let mut cfg = Config::from_lookup(lookup(&[("INTERVAL_SECONDS", "30")]));
        let cli = Cli::parse_from(["tradebrain", "--live", "--interval", "5", "--no-trading", "--once"]);
        cfg.apply_cli(&cli);
        assert_eq!(cfg.mode, TradingMode::Live);
        assert_eq!(cfg.interval, Duration::from_secs(5));
        assert!(!cfg.trading_enabled);
        assert!(cfg.once);
    }
}
