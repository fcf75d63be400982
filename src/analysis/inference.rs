//! HTTP plumbing shared by the detection and nutrition adapters.
//!
//! The adapters own their request/response schema; this module only moves a
//! JSON document over the wire under a deadline and classifies what went wrong.

use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose, Engine};
use serde_json::Value;
use tracing::debug;

use crate::config::InferenceConfig;

#[derive(Debug)]
pub enum CallError {
    Timeout(Duration),
    Service(String),
    Parse(String),
}

#[derive(Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl InferenceClient {
    pub fn new(cfg: &InferenceConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            url: cfg.url.clone(),
            api_key: cfg.api_key.clone(),
            timeout: cfg.timeout,
        })
    }

    /// POST `body` and return the response as an untyped JSON value.
    ///
    /// The whole exchange (connect, send, read body) shares one deadline.
    pub async fn post_json(&self, body: &Value) -> Result<Value, CallError> {
        match tokio::time::timeout(self.timeout, self.exchange(body)).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout(self.timeout)),
        }
    }

    async fn exchange(&self, body: &Value) -> Result<Value, CallError> {
        let mut req = self.http.post(&self.url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| self.classify(e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CallError::Service(format!(
                "{} returned {}: {}",
                self.url,
                status,
                truncate(&text, 200)
            )));
        }

        let raw = resp.bytes().await.map_err(|e| self.classify(e))?;
        debug!(url = %self.url, bytes = raw.len(), "inference response received");
        serde_json::from_slice::<Value>(&raw)
            .map_err(|e| CallError::Parse(format!("response is not JSON: {e}")))
    }

    fn classify(&self, e: reqwest::Error) -> CallError {
        if e.is_timeout() {
            CallError::Timeout(self.timeout)
        } else {
            CallError::Service(e.to_string())
        }
    }
}

pub fn encode_image(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Read a required finite number from `obj[key]`.
pub fn require_number(obj: &Value, key: &str) -> Result<f64, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Err(format!("missing field '{key}'")),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .ok_or_else(|| format!("field '{key}' is not a finite number: {v}")),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
