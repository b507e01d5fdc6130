// ===============================
// src/gateway.rs (execution API via relay)
// ===============================
//
// Semua call ke execution API lewat sini:
// - Tiap call dibatasi timeout (default 8s); timeout dihitung gagal.
// - Circuit breaker (lihat breaker.rs) memblokir call tanpa network I/O saat OPEN.
// - Klasifikasi error:
//     * permanent : relay tidak ada / salah konfigurasi (HTML, NOT_FOUND, connect refused).
//                   TIDAK masuk breaker, langsung dipropagasi ke orchestrator.
//     * transient : upstream 4xx/5xx, body rusak, timeout -> hanya menambah counter breaker.
//
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::alpaca::{
    quote_path, AccountBalances, AccountResponse, OrderRequest, QuoteResponse, RelayHeaders,
    RelayRequest, ACCOUNT_PATH, ORDERS_PATH,
};
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::domain::now_ms;
use crate::metrics::{BREAKER_OPEN, GATEWAY_CALLS};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("execution relay unavailable: {0}")]
    RelayUnavailable(String),
    #[error("execution API credentials not configured")]
    MissingCredentials,
    #[error("circuit breaker open: skipping execution API calls until {until_ms}")]
    CircuitOpen { until_ms: i64 },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream rejected request ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// Permanent = relay absen / tidak bisa dipakai sama sekali. Orchestrator harus demote ke simulasi.
    pub fn is_permanent(&self) -> bool {
        matches!(self, GatewayError::RelayUnavailable(_) | GatewayError::MissingCredentials)
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub key_id: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub relay_url: String,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:3000/api/alpaca".to_string(),
            timeout: Duration::from_secs(8),
            failure_threshold: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

pub struct ResilienceGateway {
    http: reqwest::Client,
    relay_url: String,
    credentials: Option<Credentials>,
    timeout: Duration,
    breaker: CircuitBreaker,
}

impl ResilienceGateway {
    pub fn new(cfg: GatewayConfig, credentials: Option<Credentials>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            relay_url: cfg.relay_url,
            credentials,
            timeout: cfg.timeout,
            breaker: CircuitBreaker::new(cfg.failure_threshold, cfg.backoff),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    #[cfg(test)]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Sinkronkan gauge BREAKER_OPEN dengan state breaker saat `now`. Return true kalau open.
    pub fn publish_breaker(&self, now: i64) -> bool {
        let open = matches!(self.breaker.state(now), BreakerState::Open { .. });
        BREAKER_OPEN.set(open as i64);
        open
    }

    /// Call yang dibatalkan caller karena melewati batas waktunya sendiri (future di-drop
    /// sebelum `call` sempat mencatat hasil). Dihitung sebagai failure transient.
    pub fn record_stall(&self, target: &str, after: Duration) {
        warn!(%target, ?after, "execution API call abandoned by caller timeout");
        self.breaker.record_failure(now_ms());
        self.publish_breaker(now_ms());
        GATEWAY_CALLS.with_label_values(&["transient"]).inc();
    }

    pub async fn account(&self) -> Result<AccountBalances, GatewayError> {
        let acc: AccountResponse = self.call(ACCOUNT_PATH, "GET", None).await?;
        acc.balances()
            .ok_or_else(|| GatewayError::Malformed(format!("account numbers not parseable: {acc:?}")))
    }

    /// Submit market order. Return body ack mentah (fill tidak dikonfirmasi sinkron).
    pub async fn submit_order(&self, order: &OrderRequest) -> Result<Value, GatewayError> {
        let body = serde_json::to_value(order).map_err(|e| GatewayError::Malformed(e.to_string()))?;
        self.call(ORDERS_PATH, "POST", Some(body)).await
    }

    pub async fn latest_quote(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        let q: QuoteResponse = self.call(&quote_path(symbol), "GET", None).await?;
        Ok(q.best_price())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        path: &str,
        method: &str,
        body: Option<Value>,
    ) -> Result<T, GatewayError> {
        if let BreakerState::Open { until_ms } = self.breaker.state(now_ms()) {
            BREAKER_OPEN.set(1);
            GATEWAY_CALLS.with_label_values(&["short_circuit"]).inc();
            return Err(GatewayError::CircuitOpen { until_ms });
        }
        let creds = self.credentials.as_ref().ok_or(GatewayError::MissingCredentials)?;

        let res = self
            .send(path, method, creds, body)
            .await
            .and_then(|v| serde_json::from_value::<T>(v).map_err(|e| GatewayError::Malformed(e.to_string())));

        match &res {
            Ok(_) => {
                self.breaker.record_success();
                GATEWAY_CALLS.with_label_values(&["ok"]).inc();
            }
            Err(e) if e.is_permanent() => {
                warn!(%path, error = %e, "execution relay unavailable");
                GATEWAY_CALLS.with_label_values(&["permanent"]).inc();
            }
            Err(e) => {
                self.breaker.record_failure(now_ms());
                debug!(%path, error = %e, failures = self.breaker.consecutive_failures(), "execution API call failed");
                GATEWAY_CALLS.with_label_values(&["transient"]).inc();
            }
        }
        self.publish_breaker(now_ms());
        res
    }

    async fn send(
        &self,
        path: &str,
        method: &str,
        creds: &Credentials,
        body: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let envelope = RelayRequest {
            target_path: path,
            method,
            headers: RelayHeaders {
                key_id: &creds.key_id,
                secret: &creds.secret,
                content_type: "application/json",
            },
            body,
        };

        let rsp = self
            .http
            .post(&self.relay_url)
            .json(&envelope)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = rsp.status();
        let content_type = rsp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        // HTML = halaman 404/SPA, artinya fungsi relay tidak ter-deploy
        if content_type.contains("text/html") {
            return Err(GatewayError::RelayUnavailable(format!("relay answered with HTML ({status})")));
        }

        let text = rsp.text().await.map_err(|e| self.classify_transport(e))?;

        if status == reqwest::StatusCode::NOT_FOUND && text.contains("NOT_FOUND") {
            return Err(GatewayError::RelayUnavailable("relay endpoint NOT_FOUND".to_string()));
        }
        if !status.is_success() {
            return Err(GatewayError::Upstream { status: status.as_u16(), message: upstream_message(&text) });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::Malformed(e.to_string()))
    }

    fn classify_transport(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else if e.is_connect() {
            GatewayError::RelayUnavailable(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Ambil `message` / `error` dari body JSON upstream, atau potong teks mentah.
fn upstream_message(text: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        for key in ["message", "error"] {
            if let Some(m) = v.get(key).and_then(|m| m.as_str()) {
                return m.to_string();
            }
        }
        return "execution API error via relay".to_string();
    }
    text.chars().take(100).collect()
}
