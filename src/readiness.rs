// src/readiness.rs

//! HTTP readiness polling.
//!
//! Only a `200 OK` counts as ready. Non-200 responses and transport errors
//! mean "not yet"; the only failure is an exhausted time budget.

use reqwest::{StatusCode, Url};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported URL scheme {0:?}, must be http or https")]
    UnsupportedScheme(String),

    #[error("timeout waiting for {url} to become ready after {waited:?}")]
    Timeout { url: String, waited: Duration },

    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    /// Total budget.
    pub timeout: Duration,
    pub interval: Duration,
    /// Budget for a single request.
    pub request_timeout: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ReadinessPoller {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Validate `url` and poll it until it answers 200 or the budget runs out.
    pub async fn wait(&self, url: &str) -> Result<(), ReadinessError> {
        let parsed = validate_url(url)?;

        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .no_proxy()
            .build()
            .map_err(ReadinessError::Client)?;

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempt = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ReadinessError::Timeout {
                    url: parsed.to_string(),
                    waited: now - started,
                });
            }
            attempt += 1;

            let request = client.get(parsed.clone()).send();
            match tokio::time::timeout(deadline - now, request).await {
                Ok(Ok(resp)) if resp.status() == StatusCode::OK => {
                    debug!(url = %parsed, attempt, "endpoint ready");
                    return Ok(());
                }
                Ok(Ok(resp)) => debug!(url = %parsed, attempt, status = %resp.status(), "not ready"),
                Ok(Err(e)) => debug!(url = %parsed, attempt, error = %e, "not reachable"),
                Err(_) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }
}

/// Parse a URL and allow only `http` / `https`.
pub fn validate_url(url: &str) -> Result<Url, ReadinessError> {
    let parsed = Url::parse(url).map_err(|e| ReadinessError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ReadinessError::UnsupportedScheme(other.to_string())),
    }
}
