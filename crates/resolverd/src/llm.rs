//! LLM adapter (external collaborator, degradeable): two capabilities —
//! normalize a raw record, and arbitrate between two close candidates —
//! over one typed interface, per spec Sections 4.1/4.4/10.7.
//!
//! Both capabilities may fail; callers degrade rather than propagate.
//! Rate smoothing lives here (a shared gate the coordinator's workers all
//! submit through), not per-worker, per spec Section 5.

use resolver_core::types::{Candidate, CleanedRecord, RawRecord};
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response did not parse as the expected shape: {0}")]
    Unparseable(String),
    #[error("request timed out")]
    Timeout,
}

/// `A` or `B` or "keep automatic top" — the arbiter's only possible
/// answers (spec Section 4.4's ARBITER step).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterChoice {
    First,
    Second,
    None,
}

#[derive(Deserialize)]
struct NormalizeResponse {
    clean_name: Option<String>,
    search_token: Option<String>,
    clean_postal: Option<String>,
    clean_city: Option<String>,
}

#[derive(Deserialize)]
struct ArbiterResponse {
    choice: String,
}

/// Rate-smoothing gate: every submission waits until `min_interval` has
/// elapsed since the previous one, shared across every worker so the
/// instantaneous request rate is smooth rather than bursty (spec Section
/// 5's rate-control clause — the coordinator, not the worker, owns this).
#[derive(Debug)]
struct RateGate {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval: Duration::from_millis(min_interval_ms),
            last: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// HTTP JSON adapter over the LLM API, with a client-level timeout (turns
/// a slow call into "unavailable", per spec Section 5) and bounded retry
/// on transient transport failures only — never on a parse failure, which
/// degrades immediately (spec Section 4.1/10.7).
pub struct LlmAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    rate_gate: RateGate,
    max_attempts: u32,
    retry_backoff: Duration,
}

/// Name of the environment variable the credential is read from (spec
/// Section 6's Environment clause).
pub const API_KEY_ENV: &str = "RESOLVER_LLM_API_KEY";

impl LlmAdapter {
    /// Returns `None` when `RESOLVER_LLM_API_KEY` is absent — the caller
    /// should select the heuristic path outright, making zero network
    /// calls, rather than constructing an adapter doomed to fail.
    pub fn from_env(base_url: &str, min_interval_ms: u64) -> Option<Self> {
        let api_key = std::env::var(API_KEY_ENV).ok()?;
        Some(Self::new(base_url, Some(api_key), min_interval_ms))
    }

    pub fn new(base_url: &str, api_key: Option<String>, min_interval_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.to_string(),
            api_key,
            rate_gate: RateGate::new(min_interval_ms),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Submit the record with the fixed instruction set of spec Section
    /// 4.1. Returns `None` (never `Err`) on any failure — the caller
    /// degrades to the heuristic path and logs once.
    pub async fn normalize(&self, record: &RawRecord) -> Option<CleanedRecord> {
        match self.normalize_inner(record).await {
            Ok(cleaned) => Some(cleaned),
            Err(err) => {
                tracing::warn!(error = %err, "llm normalize unavailable, degrading to heuristic");
                None
            }
        }
    }

    async fn normalize_inner(&self, record: &RawRecord) -> Result<CleanedRecord, LlmError> {
        self.rate_gate.wait_turn().await;

        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            match self.normalize_attempt(record).await {
                Ok(resp) => {
                    return Ok(CleanedRecord {
                        clean_name: resp.clean_name.unwrap_or_default(),
                        search_token: resp.search_token.unwrap_or_default(),
                        clean_postal: resp.clean_postal,
                        clean_city: resp.clean_city,
                    });
                }
                Err(err @ LlmError::Unparseable(_)) => return Err(err),
                Err(err) => {
                    last_err = Some(err);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(LlmError::Transport("exhausted retries".into())))
    }

    async fn normalize_attempt(&self, record: &RawRecord) -> Result<NormalizeResponse, LlmError> {
        let payload = serde_json::json!({
            "fields": record.fields,
            "instructions": [
                "correct obvious misspellings in the company name",
                "strip legal suffixes (SAS, SARL, EURL, SA, SNC, SCI, SCP, SASU, ...)",
                "upper-case the cleaned name",
                "extract the single most distinctive content token, dropping generic words",
                "extract a 5-digit postal code from any address-like field, or null",
                "upper-case the city, or null if absent",
            ],
        });

        let resp = self
            .authed(self.client.post(format!("{}/normalize", self.base_url)))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        resp.json::<NormalizeResponse>()
            .await
            .map_err(|e| LlmError::Unparseable(e.to_string()))
    }

    /// Choose between two close candidates. Unavailability (any failure)
    /// means "keep the automatic top", per spec Section 4.4. Never
    /// retries — the first failure degrades.
    pub async fn arbitrate(
        &self,
        cleaned: &CleanedRecord,
        first: &Candidate,
        second: &Candidate,
    ) -> ArbiterChoice {
        self.rate_gate.wait_turn().await;
        match self.arbitrate_inner(cleaned, first, second).await {
            Ok(choice) => choice,
            Err(err) => {
                tracing::warn!(error = %err, "llm arbiter unavailable, keeping automatic top");
                ArbiterChoice::None
            }
        }
    }

    async fn arbitrate_inner(
        &self,
        cleaned: &CleanedRecord,
        first: &Candidate,
        second: &Candidate,
    ) -> Result<ArbiterChoice, LlmError> {
        let payload = serde_json::json!({
            "input": cleaned,
            "candidate_a": first,
            "candidate_b": second,
        });

        let resp = self
            .authed(self.client.post(format!("{}/arbitrate", self.base_url)))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let parsed = resp
            .json::<ArbiterResponse>()
            .await
            .map_err(|e| LlmError::Unparseable(e.to_string()))?;

        Ok(match parsed.choice.as_str() {
            "A" => ArbiterChoice::First,
            "B" => ArbiterChoice::Second,
            _ => ArbiterChoice::None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_gate_serializes_submissions_without_panicking() {
        let gate = RateGate::new(1);
        gate.wait_turn().await;
        gate.wait_turn().await;
    }

    #[test]
    fn from_env_returns_none_without_credential() {
        std::env::remove_var(API_KEY_ENV);
        assert!(LlmAdapter::from_env("http://localhost", 0).is_none());
    }
}
