// ===============================
// src/decision.rs
// ===============================
//
// Boundary ke decision model eksternal (request/response JSON).
// - Stateless: satu call = satu batch keputusan.
// - Fail-open ke "tidak ada aksi": respon rusak / error transport -> list kosong.
// - Tiap entry divalidasi: action harus BUY|SELL|HOLD, quantity angka finite >= 0.
//   Entry invalid dibuang dan dihitung, tidak pernah dieksekusi.
//
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{Decision, MarketQuote, PortfolioState, TradeAction, TradeDecision};
use crate::metrics::{DECISIONS, DECISIONS_DROPPED};

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("decision model transport error: {0}")]
    Transport(String),
    #[error("decision model returned status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateView {
    pub symbol: String,
    pub price: f64,
    pub change_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioView {
    pub cash: f64,
    pub positions: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub candidates: Vec<CandidateView>,
    pub market_context: String,
    pub learning_context: String,
    pub portfolio: PortfolioView,
}

impl DecisionRequest {
    pub fn build(
        candidates: &[MarketQuote],
        market_context: &str,
        learning_context: &str,
        portfolio: &PortfolioState,
    ) -> Self {
        Self {
            candidates: candidates
                .iter()
                .map(|q| CandidateView { symbol: q.symbol.clone(), price: q.price, change_percent: q.change_percent })
                .collect(),
            market_context: market_context.to_string(),
            learning_context: learning_context.to_string(),
            portfolio: PortfolioView {
                cash: portfolio.cash,
                positions: portfolio.positions.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            },
        }
    }
}

/// Model eksternal: terima request, kembalikan body mentah (diharapkan JSON).
#[async_trait]
pub trait DecisionModel: Send + Sync {
    async fn complete(&self, request: &DecisionRequest) -> Result<String, DecisionError>;
}

pub struct HttpDecisionModel {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpDecisionModel {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), url: url.into(), api_key, timeout }
    }
}

#[async_trait]
impl DecisionModel for HttpDecisionModel {
    async fn complete(&self, request: &DecisionRequest) -> Result<String, DecisionError> {
        let mut req = self.http.post(&self.url).json(request).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let rsp = req.send().await.map_err(|e| DecisionError::Transport(e.to_string()))?;
        let status = rsp.status();
        let body = rsp.text().await.map_err(|e| DecisionError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(DecisionError::Status { status: status.as_u16(), body: body.chars().take(200).collect() });
        }
        Ok(body)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionBatch {
    pub decisions: Vec<TradeDecision>,
    pub dropped: usize,
}

fn strip_fences(text: &str) -> &str {
    let t = text.trim();
    let t = t.strip_prefix("```json").or_else(|| t.strip_prefix("```")).unwrap_or(t);
    t.strip_suffix("```").unwrap_or(t).trim()
}

fn parse_entry(v: &Value) -> Option<TradeDecision> {
    let symbol = v.get("symbol")?.as_str()?.trim();
    if symbol.is_empty() {
        return None;
    }
    let action = TradeAction::parse(v.get("action")?.as_str()?)?;
    let quantity = v.get("quantity")?.as_f64()?;
    if !quantity.is_finite() || quantity < 0.0 {
        return None;
    }
    // lembar utuh
    let qty = quantity.trunc() as u64;
    let decision = match action {
        TradeAction::Buy => Decision::Buy { qty },
        TradeAction::Sell => Decision::Sell { qty },
        TradeAction::Hold => Decision::Hold,
    };
    let confidence = v
        .get("confidence")
        .and_then(|c| c.as_f64())
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 100.0))
        .unwrap_or(0.0);
    let reasoning = v.get("reasoning").and_then(|r| r.as_str()).unwrap_or_default().to_string();

    Some(TradeDecision { symbol: symbol.to_string(), decision, confidence, reasoning })
}

/// Parse respon model menjadi keputusan tervalidasi. Non-JSON -> batch kosong.
pub fn parse_decisions(text: &str) -> DecisionBatch {
    let Ok(root) = serde_json::from_str::<Value>(strip_fences(text)) else {
        return DecisionBatch::default();
    };
    let Some(entries) = root.get("decisions").and_then(|d| d.as_array()) else {
        return DecisionBatch::default();
    };

    let mut batch = DecisionBatch::default();
    for e in entries {
        match parse_entry(e) {
            Some(d) => batch.decisions.push(d),
            None => batch.dropped += 1,
        }
    }
    batch
}

pub struct DecisionEngine {
    model: Box<dyn DecisionModel>,
}

impl DecisionEngine {
    pub fn new(model: Box<dyn DecisionModel>) -> Self {
        Self { model }
    }

    pub async fn decide(
        &self,
        candidates: &[MarketQuote],
        market_context: &str,
        learning_context: &str,
        portfolio: &PortfolioState,
    ) -> DecisionBatch {
        let request = DecisionRequest::build(candidates, market_context, learning_context, portfolio);
        let body = match self.model.complete(&request).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "decision model unavailable, no decisions this cycle");
                return DecisionBatch::default();
            }
        };

        let batch = parse_decisions(&body);
        if batch.dropped > 0 {
            warn!(dropped = batch.dropped, "dropped invalid decisions from model");
            DECISIONS_DROPPED.inc_by(batch.dropped as u64);
        }
        for d in &batch.decisions {
            DECISIONS.with_label_values(&[d.decision.action().label()]).inc();
            debug!(symbol = %d.symbol, action = d.decision.action().label(), qty = d.decision.qty(), confidence = d.confidence, "decision");
        }
        batch
    }
}
