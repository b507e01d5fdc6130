// ===============================
// src/feed.rs
// ===============================
//
// Market sampler. Waterfall per symbol:
// - crypto (BTC/USD, ...)       : sumber publik (crypto.rs)
// - live + credentials          : quote endpoint execution API (via gateway)
// - selain itu / kalau kosong   : random walk simulasi per symbol
//
// Random walk:
//   price += (uniform(-0.5,0.5) + trend*0.05) * price * 1.5%
//   10% peluang trend berbalik tiap step, floor 1.0.
//
// Notes:
// - Fan-out quote dilakukan konkuren (join_all), tiap symbol dibatasi timeout sendiri.
// - State walk hanya dimutasi setelah fan-in, jadi tidak perlu lock.
// - Quote real meng-anchor state walk symbol tsb supaya simulasi tetap kontinu.
//
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::alpaca::quote_path;
use crate::crypto::{is_crypto, CryptoQuotes};
use crate::domain::{now_ms, MarketQuote};
use crate::gateway::{GatewayError, ResilienceGateway};
use crate::metrics::QUOTES;

pub const VOLATILITY: f64 = 0.015;
pub const TREND_DRIFT: f64 = 0.05;
pub const REVERSAL_PROB: f64 = 0.10;
pub const PRICE_FLOOR: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkState {
    pub price: f64,
    pub trend: f64, // +1 / -1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteSource {
    Crypto,
    Live,
    Simulated,
}

impl QuoteSource {
    fn label(&self) -> &'static str {
        match self {
            QuoteSource::Crypto => "crypto",
            QuoteSource::Live => "live",
            QuoteSource::Simulated => "simulated",
        }
    }
}

type Fetched = Result<Option<(f64, QuoteSource)>, GatewayError>;

fn round_to(x: f64, decimals: i32) -> f64 {
    let f = 10f64.powi(decimals);
    (x * f).round() / f
}

fn initial_walk(symbol: &str, rng: &mut StdRng) -> WalkState {
    let price = if symbol.contains("BTC") {
        65_000.0
    } else if symbol.contains("ETH") {
        3_500.0
    } else if symbol == "SPY" {
        500.0
    } else if symbol == "NVDA" {
        900.0
    } else {
        rng.gen_range(10.0..210.0)
    };
    let trend = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
    WalkState { price, trend }
}

pub struct MarketSampler {
    universe: Vec<String>,
    walks: HashMap<String, WalkState>,
    rng: StdRng,
    gateway: Arc<ResilienceGateway>,
    crypto: CryptoQuotes,
    sample_timeout: Duration,
}

impl MarketSampler {
    pub fn new(
        universe: Vec<String>,
        gateway: Arc<ResilienceGateway>,
        crypto: CryptoQuotes,
        seed: Option<u64>,
        sample_timeout: Duration,
    ) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { universe, walks: HashMap::new(), rng, gateway, crypto, sample_timeout }
    }

    #[cfg(test)]
    pub fn walk(&self, symbol: &str) -> Option<WalkState> {
        self.walks.get(symbol).copied()
    }

    /// Satu step random walk untuk `symbol`.
    pub fn step_simulated(&mut self, symbol: &str) -> MarketQuote {
        let rng = &mut self.rng;
        let state = self
            .walks
            .entry(symbol.to_string())
            .or_insert_with(|| initial_walk(symbol, rng));

        let prev = state.price;
        let noise: f64 = rng.gen_range(-0.5..0.5);
        state.price += (noise + state.trend * TREND_DRIFT) * state.price * VOLATILITY;
        if rng.gen_bool(REVERSAL_PROB) {
            state.trend = -state.trend;
        }
        if state.price < PRICE_FLOOR {
            state.price = PRICE_FLOOR;
        }

        QUOTES.with_label_values(&[QuoteSource::Simulated.label()]).inc();
        MarketQuote {
            symbol: symbol.to_string(),
            price: round_to(state.price, 2),
            change_percent: round_to((state.price - prev) / prev * 100.0, 4),
            timestamp: now_ms(),
        }
    }

    /// Quote real: change% dihitung terhadap sample sebelumnya symbol ini (0 kalau baru).
    fn anchor(&mut self, symbol: &str, price: f64, source: QuoteSource) -> MarketQuote {
        let change_percent = match self.walks.get_mut(symbol) {
            Some(state) => {
                let prev = state.price;
                state.price = price;
                round_to((price - prev) / prev * 100.0, 4)
            }
            None => {
                let mut state = initial_walk(symbol, &mut self.rng);
                state.price = price;
                self.walks.insert(symbol.to_string(), state);
                0.0
            }
        };
        QUOTES.with_label_values(&[source.label()]).inc();
        MarketQuote { symbol: symbol.to_string(), price, change_percent, timestamp: now_ms() }
    }

    async fn fetch_external(&self, symbol: &str, live: bool) -> Fetched {
        if is_crypto(symbol) {
            return Ok(self.crypto.quote(symbol).await.map(|p| (p, QuoteSource::Crypto)));
        }
        if live && self.gateway.has_credentials() {
            let px = self.gateway.latest_quote(symbol).await?;
            return Ok(px.map(|p| (p, QuoteSource::Live)));
        }
        Ok(None)
    }

    async fn fetch_bounded(&self, symbol: &str, live: bool) -> Fetched {
        let via_gateway = live && !is_crypto(symbol) && self.gateway.has_credentials();
        match timeout(self.sample_timeout, self.fetch_external(symbol, live)).await {
            Ok(r) => r,
            Err(_) => {
                warn!(%symbol, timeout = ?self.sample_timeout, "quote fetch timed out, using simulation");
                // call gateway ikut di-drop sebelum sempat dicatat; catat di sini
                if via_gateway {
                    self.gateway.record_stall(&quote_path(symbol), self.sample_timeout);
                }
                Ok(None)
            }
        }
    }

    fn resolve(&mut self, symbol: &str, fetched: Fetched) -> Result<MarketQuote, GatewayError> {
        match fetched {
            Ok(Some((px, src))) => Ok(self.anchor(symbol, px, src)),
            Ok(None) => Ok(self.step_simulated(symbol)),
            Err(e) if e.is_permanent() => Err(e),
            Err(e) => {
                debug!(%symbol, error = %e, "quote failed, using simulation");
                Ok(self.step_simulated(symbol))
            }
        }
    }

    #[cfg(test)]
    pub async fn sample(&mut self, symbol: &str, live: bool) -> Result<MarketQuote, GatewayError> {
        let fetched = self.fetch_bounded(symbol, live).await;
        self.resolve(symbol, fetched)
    }

    /// `n` symbol acak dari universe + semua symbol yang sedang dipegang.
    pub fn select_batch(&mut self, n: usize, held: &[String]) -> Vec<String> {
        let mut out: Vec<String> = self
            .universe
            .choose_multiple(&mut self.rng, n)
            .cloned()
            .collect();
        for sym in held {
            if !out.contains(sym) {
                out.push(sym.clone());
            }
        }
        out
    }

    /// Sample batch secara konkuren. Gagal transient per symbol -> nilai simulasi;
    /// gagal permanent -> seluruh batch dibatalkan.
    pub async fn scan_batch(
        &mut self,
        n: usize,
        held: &[String],
        live: bool,
    ) -> Result<Vec<MarketQuote>, GatewayError> {
        let symbols = self.select_batch(n, held);
        let fetched: Vec<Fetched> = {
            let this = &*self;
            join_all(symbols.iter().map(|s| this.fetch_bounded(s, live))).await
        };

        let mut quotes = Vec::with_capacity(symbols.len());
        for (sym, f) in symbols.iter().zip(fetched) {
            quotes.push(self.resolve(sym, f)?);
        }
        Ok(quotes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Credentials, GatewayConfig};
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn universe() -> Vec<String> {
        ["AAPL", "MSFT", "SPY", "NVDA", "TSLA", "AMD"].iter().map(|s| s.to_string()).collect()
    }

    fn offline_gateway() -> Arc<ResilienceGateway> {
        Arc::new(ResilienceGateway::new(GatewayConfig::default(), None).unwrap())
    }

    fn live_gateway(relay: &MockServer) -> Arc<ResilienceGateway> {
        let cfg = GatewayConfig {
            relay_url: relay.uri(),
            timeout: Duration::from_millis(300),
            ..GatewayConfig::default()
        };
        let creds = Credentials { key_id: "k".into(), secret: "s".into() };
        Arc::new(ResilienceGateway::new(cfg, Some(creds)).unwrap())
    }

    fn sampler(gw: Arc<ResilienceGateway>, crypto_url: &str) -> MarketSampler {
        MarketSampler::new(
            universe(),
            gw,
            CryptoQuotes::new(crypto_url, Duration::from_millis(300)),
            Some(42),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn seeded_walk_is_deterministic() {
        let mut a = sampler(offline_gateway(), "http://127.0.0.1:1");
        let mut b = sampler(offline_gateway(), "http://127.0.0.1:1");
        for _ in 0..20 {
            assert_eq!(a.step_simulated("AAPL").price, b.step_simulated("AAPL").price);
        }
    }

    #[test]
    fn walk_step_is_bounded_and_floored() {
        let mut s = sampler(offline_gateway(), "http://127.0.0.1:1");
        s.walks.insert("PENNY".into(), WalkState { price: 1.01, trend: -1.0 });
        for _ in 0..500 {
            let before = s.walk("PENNY").unwrap().price;
            let q = s.step_simulated("PENNY");
            assert!(q.price >= PRICE_FLOOR);
            let max_move = (0.5 + TREND_DRIFT) * before * VOLATILITY + 1e-9;
            let after = s.walk("PENNY").unwrap().price;
            assert!(after >= PRICE_FLOOR);
            if after > PRICE_FLOOR {
                assert!((after - before).abs() <= max_move);
            }
        }
    }

    #[test]
    fn well_known_symbols_start_at_fixed_prices() {
        let mut s = sampler(offline_gateway(), "http://127.0.0.1:1");
        let q = s.step_simulated("SPY");
        assert!((q.price - 500.0).abs() <= 500.0 * 0.55 * VOLATILITY + 0.01);
        let q = s.step_simulated("BTC/USD");
        assert!((q.price - 65_000.0).abs() <= 65_000.0 * 0.55 * VOLATILITY + 0.01);
    }

    #[tokio::test]
    async fn batch_includes_held_symbols() {
        let mut s = sampler(offline_gateway(), "http://127.0.0.1:1");
        let held = vec!["HELD".to_string()];
        let quotes = s.scan_batch(3, &held, false).await.unwrap();
        assert_eq!(quotes.len(), 4);
        assert!(quotes.iter().any(|q| q.symbol == "HELD"));
        assert!(quotes.iter().all(|q| q.price >= PRICE_FLOOR));
    }

    #[tokio::test]
    async fn live_quote_used_and_change_tracked() {
        let relay = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"quote": {"ap": 200.0, "bp": 199.5}})))
            .up_to_n_times(1)
            .mount(&relay)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"quote": {"bp": 202.0}})))
            .mount(&relay)
            .await;

        let mut s = sampler(live_gateway(&relay), "http://127.0.0.1:1");
        let first = s.sample("AAPL", true).await.unwrap();
        assert_eq!(first.price, 200.0);
        assert_eq!(first.change_percent, 0.0);
        let second = s.sample("AAPL", true).await.unwrap();
        assert_eq!(second.price, 202.0);
        assert_eq!(second.change_percent, 1.0);
    }

    #[tokio::test]
    async fn transient_failures_fall_back_to_simulation() {
        let relay = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&relay)
            .await;

        let mut s = sampler(live_gateway(&relay), "http://127.0.0.1:1");
        let quotes = s.scan_batch(5, &[], true).await.unwrap();
        assert_eq!(quotes.len(), 5);
        for q in &quotes {
            assert!(s.walk(&q.symbol).is_some());
        }
    }

    #[tokio::test]
    async fn stalled_source_does_not_stall_batch() {
        let relay = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"quote": {"ap": 10.0}}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&relay)
            .await;

        let cfg = GatewayConfig { relay_url: relay.uri(), timeout: Duration::from_secs(10), ..GatewayConfig::default() };
        let creds = Credentials { key_id: "k".into(), secret: "s".into() };
        let gw = Arc::new(ResilienceGateway::new(cfg, Some(creds)).unwrap());
        let mut s = MarketSampler::new(
            universe(),
            gw,
            CryptoQuotes::new("http://127.0.0.1:1", Duration::from_millis(100)),
            Some(7),
            Duration::from_millis(200),
        );

        let started = std::time::Instant::now();
        let quotes = s.scan_batch(3, &[], true).await.unwrap();
        assert_eq!(quotes.len(), 3);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn stalled_quotes_open_breaker_after_three_scans() {
        let relay = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"quote": {"ap": 10.0}}))
                    .set_delay(Duration::from_secs(3)),
            )
            .expect(3)
            .mount(&relay)
            .await;

        // sama seperti wiring main: batas per-sample == timeout gateway
        let limit = Duration::from_millis(300);
        let cfg = GatewayConfig { relay_url: relay.uri(), timeout: limit, ..GatewayConfig::default() };
        let creds = Credentials { key_id: "k".into(), secret: "s".into() };
        let gw = Arc::new(ResilienceGateway::new(cfg, Some(creds)).unwrap());
        let mut s = MarketSampler::new(
            vec!["AAPL".to_string()],
            gw.clone(),
            CryptoQuotes::new("http://127.0.0.1:1", Duration::from_millis(100)),
            Some(3),
            limit,
        );

        for scan in 1..=5u32 {
            let quotes = s.scan_batch(1, &[], true).await.unwrap();
            assert_eq!(quotes.len(), 1);
            let failures = gw.breaker().consecutive_failures();
            assert_eq!(failures, scan.min(3), "scan {scan}");
            assert_eq!(gw.publish_breaker(now_ms()), scan >= 3, "scan {scan}");
        }
        // relay hanya menerima 3 request; scan 4 & 5 short-circuit (diverifikasi saat drop)
    }

    #[tokio::test]
    async fn permanent_failure_aborts_batch() {
        let relay = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<!doctype html>", "text/html"))
            .mount(&relay)
            .await;

        let mut s = sampler(live_gateway(&relay), "http://127.0.0.1:1");
        let err = s.scan_batch(4, &[], true).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn crypto_symbols_use_public_source_in_simulation() {
        let coins = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ethereum": {"usd": 3100.25}})))
            .mount(&coins)
            .await;

        let mut s = sampler(offline_gateway(), &coins.uri());
        let q = s.sample("ETH/USD", false).await.unwrap();
        assert_eq!(q.price, 3100.25);
    }
}
