// ===============================
// src/crypto.rs
// ===============================
//
// Sumber quote crypto publik (tanpa auth), format CoinGecko `simple/price`.
// Tidak lewat circuit breaker: semua kegagalan = "tidak ada quote", caller fallback ke simulasi.
//
use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Symbol domain -> id di sumber publik
pub fn coin_id(symbol: &str) -> Option<&'static str> {
    match symbol {
        "BTC/USD" => Some("bitcoin"),
        "ETH/USD" => Some("ethereum"),
        "SOL/USD" => Some("solana"),
        "DOGE/USD" => Some("dogecoin"),
        "DOT/USD" => Some("polkadot"),
        "ADA/USD" => Some("cardano"),
        _ => None,
    }
}

pub fn is_crypto(symbol: &str) -> bool {
    symbol.ends_with("/USD")
}

pub struct CryptoQuotes {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl CryptoQuotes {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into(), timeout }
    }

    pub async fn quote(&self, symbol: &str) -> Option<f64> {
        let id = coin_id(symbol)?;
        let url = match Url::parse_with_params(
            &format!("{}/simple/price", self.base_url.trim_end_matches('/')),
            &[("ids", id), ("vs_currencies", "usd")],
        ) {
            Ok(u) => u,
            Err(e) => {
                debug!(?e, base = %self.base_url, "bad crypto quote url");
                return None;
            }
        };

        let rsp = match self.http.get(url).timeout(self.timeout).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(status = %r.status(), %symbol, "crypto quote rejected");
                return None;
            }
            Err(e) => {
                debug!(?e, %symbol, "crypto quote fetch failed");
                return None;
            }
        };
        let v = rsp.json::<Value>().await.ok()?;
        v.get(id)?
            .get("usd")?
            .as_f64()
            .filter(|p| p.is_finite() && *p > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn reads_usd_price_for_mapped_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/simple/price"))
            .and(query_param("ids", "bitcoin"))
            .and(query_param("vs_currencies", "usd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"bitcoin": {"usd": 64123.5}})))
            .mount(&server)
            .await;

        let src = CryptoQuotes::new(server.uri(), Duration::from_secs(1));
        assert_eq!(src.quote("BTC/USD").await, Some(64123.5));
    }

    #[tokio::test]
    async fn unmapped_symbol_or_error_yields_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let src = CryptoQuotes::new(server.uri(), Duration::from_secs(1));
        assert_eq!(src.quote("XRP/USD").await, None);
        assert_eq!(src.quote("ETH/USD").await, None);
    }

    #[test]
    fn crypto_detection() {
        assert!(is_crypto("BTC/USD"));
        assert!(!is_crypto("AAPL"));
    }
}
