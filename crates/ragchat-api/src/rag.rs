//! Client for the external retrieval-augmented answering service.
//!
//! One bounded-timeout attempt per question. Every way the call can go wrong
//! (timeout, transport error, non-2xx, unparsable body, missing answer) comes
//! back as a [`RagError`] carrying the provider status and body when known.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

pub const MIN_TOP_K: i64 = 1;
pub const MAX_TOP_K: i64 = 20;
pub const DEFAULT_TOP_K: i64 = 5;
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_QUERY_PATH: &str = "/rag/query";

/// Defaults applied when the caller leaves `k` or `evaluate` out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RagDefaults {
    pub top_k: i64,
    pub evaluate: bool,
}

impl Default for RagDefaults {
    fn default() -> Self {
        Self { top_k: DEFAULT_TOP_K, evaluate: true }
    }
}

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub defaults: RagDefaults,
}

impl RagConfig {
    /// Build from `RAG_*` environment variables. Invalid values fall back to defaults.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self {
            endpoint: endpoint(
                var("RAG_API_URL").as_deref(),
                var("RAG_BASE_URL").as_deref(),
                var("RAG_QUERY_PATH").as_deref(),
            ),
            api_key: var("RAG_API_KEY").map(|k| k.trim().to_string()).filter(|k| !k.is_empty()),
            timeout: Duration::from_millis(timeout_ms(var("RAG_TIMEOUT_MS").as_deref())),
            defaults: RagDefaults {
                top_k: top_k(var("RAG_DEFAULT_TOP_K").as_deref()),
                evaluate: evaluate(var("RAG_DEFAULT_EVALUATE").as_deref()),
            },
        }
    }
}

/// Full URL wins; otherwise `base` joined with `path`.
pub fn endpoint(api_url: Option<&str>, base: Option<&str>, path: Option<&str>) -> String {
    if let Some(url) = api_url.map(str::trim).filter(|u| !u.is_empty()) {
        return url.to_string();
    }
    let base = base.map(str::trim).filter(|b| !b.is_empty()).unwrap_or(DEFAULT_BASE_URL);
    let path = path.map(str::trim).filter(|p| !p.is_empty()).unwrap_or(DEFAULT_QUERY_PATH);
    let base = if base.ends_with('/') { base.to_string() } else { format!("{base}/") };
    url::Url::parse(&base)
        .and_then(|b| b.join(path))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("{DEFAULT_BASE_URL}{DEFAULT_QUERY_PATH}"))
}

pub fn top_k(raw: Option<&str>) -> i64 {
    raw.and_then(|r| r.trim().parse::<f64>().ok())
        .filter(|k| k.is_finite() && *k >= 1.0)
        .map(|k| (k.round() as i64).clamp(MIN_TOP_K, MAX_TOP_K))
        .unwrap_or(DEFAULT_TOP_K)
}

pub fn timeout_ms(raw: Option<&str>) -> u64 {
    raw.and_then(|r| r.trim().parse::<f64>().ok())
        .filter(|t| t.is_finite() && *t > 0.0)
        .map(|t| t.round() as u64)
        .unwrap_or(DEFAULT_TIMEOUT_MS)
}

pub fn evaluate(raw: Option<&str>) -> bool {
    !matches!(raw.map(|r| r.trim().to_ascii_lowercase()).as_deref(), Some("0") | Some("false"))
}

/// Validated request body sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagRequest {
    pub question: String,
    pub k: i64,
    pub evaluate: bool,
}

impl RagRequest {
    /// Validate caller input. The question is trimmed; `k` must be in 1..=20.
    pub fn build(
        question: Option<&str>,
        k: Option<i64>,
        evaluate: Option<bool>,
        defaults: RagDefaults,
    ) -> Result<Self, RagError> {
        let question = question.map(str::trim).unwrap_or_default();
        if question.is_empty() {
            return Err(RagError::new("question is required"));
        }
        let k = k.unwrap_or(defaults.top_k);
        if !(MIN_TOP_K..=MAX_TOP_K).contains(&k) {
            return Err(RagError::new("k must be between 1 and 20"));
        }
        Ok(Self {
            question: question.to_string(),
            k,
            evaluate: evaluate.unwrap_or(defaults.evaluate),
        })
    }
}

/// A validated provider answer.
#[derive(Debug, Clone)]
pub struct RagAnswer {
    pub answer: String,
    pub sources: Vec<Value>,
    pub evaluation: Option<Value>,
    /// Provider-reported latency when numeric, measured wall clock otherwise.
    pub latency_ms: i64,
    pub raw: Value,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RagError {
    pub message: String,
    /// HTTP status reported by the provider, if a response arrived.
    pub status: Option<u16>,
    pub details: Option<Value>,
}

impl RagError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), status: None, details: None }
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The provider rejected the request itself (4xx).
    pub fn is_client_fault(&self) -> bool {
        matches!(self.status, Some(400..=499))
    }
}

/// Anything that can answer a question. The pipeline depends on this seam.
#[async_trait]
pub trait Answerer: Send + Sync {
    fn defaults(&self) -> RagDefaults {
        RagDefaults::default()
    }

    async fn answer(&self, request: &RagRequest) -> Result<RagAnswer, RagError>;
}

pub struct RagClient {
    http: reqwest::Client,
    config: RagConfig,
}

impl RagClient {
    pub fn new(config: RagConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

#[async_trait]
impl Answerer for RagClient {
    fn defaults(&self) -> RagDefaults {
        self.config.defaults
    }

    async fn answer(&self, request: &RagRequest) -> Result<RagAnswer, RagError> {
        let mut call = self
            .http
            .post(&self.config.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(request);
        if let Some(key) = &self.config.api_key {
            call = call.header(AUTHORIZATION, format!("Bearer {key}"));
        }

        let started = Instant::now();
        let resp = call.send().await.map_err(transport_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;
        let measured_ms = started.elapsed().as_millis() as i64;
        debug!(status = status.as_u16(), measured_ms, "RAG provider responded");

        interpret(status.as_u16(), &text, measured_ms)
    }
}

fn transport_error(e: reqwest::Error) -> RagError {
    if e.is_timeout() {
        warn!("RAG request timed out");
        RagError::new("timed out waiting for the RAG engine")
    } else {
        warn!("RAG request failed: {}", e);
        RagError::new("could not reach the RAG engine").with_details(Value::String(e.to_string()))
    }
}

/// Classify a provider response.
fn interpret(status: u16, text: &str, measured_ms: i64) -> Result<RagAnswer, RagError> {
    let parsed = serde_json::from_str::<Value>(text);

    if !(200..300).contains(&status) {
        let details = parsed.unwrap_or_else(|_| Value::String(text.to_string()));
        return Err(RagError::new("the RAG engine returned an error")
            .with_status(status)
            .with_details(details));
    }

    let data = parsed.map_err(|_| {
        RagError::new("invalid JSON from the RAG engine")
            .with_status(status)
            .with_details(Value::String(text.to_string()))
    })?;

    let answer = data
        .get("answer")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string);
    let Some(answer) = answer else {
        return Err(RagError::new("the RAG engine returned no usable answer")
            .with_status(status)
            .with_details(data));
    };

    let sources = data.get("sources").and_then(Value::as_array).cloned().unwrap_or_default();
    let evaluation = data
        .get("eval")
        .or_else(|| data.get("evaluation"))
        .filter(|v| !v.is_null())
        .cloned();
    let latency_ms = data
        .get("latency_ms")
        .and_then(Value::as_f64)
        .filter(|l| l.is_finite())
        .map(|l| l.round().max(0.0) as i64)
        .unwrap_or(measured_ms);

    Ok(RagAnswer { answer, sources, evaluation, latency_ms, raw: data })
}
