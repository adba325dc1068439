//! Boundary messaging client with timeout and exponential backoff
//!
//! [`MessagingClient::send`] issues a request over a host-provided
//! [`Transport`], bounded by a hard timeout. Failures are classified with
//! [`classify`], recorded in the [`ErrorLog`] and retried while the
//! [`RetryPolicy`] allows it. An `ok: false` envelope is never retried.
//!
//! A timed-out call is dropped locally; a response that arrives later has
//! nowhere to go and is discarded with the dropped future.

use crate::classify::{classify, ErrorKind, Failure};
use crate::error::{Result, SyncError};
use crate::error_log::ErrorLog;
use crate::protocol::{
    Envelope, GetManyResponse, HealthResponse, Request, SetStateResponse,
};
use crate::record::{ItemState, Record};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Channel to the authoritative side
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one request and wait for its envelope
    async fn call(&self, request: Request) -> std::result::Result<Envelope, Failure>;
}

/// Decides whether a classified failure is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(ErrorKind) -> bool + Send + Sync>;

/// Retry and timeout behavior for boundary calls
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Hard timeout for each attempt
    pub timeout: Duration,
    /// Random ± variation applied to each delay (0.0 - 1.0)
    pub jitter: f64,
    should_retry: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2_000),
            timeout: Duration::from_millis(5_000),
            jitter: 0.0,
            should_retry: Arc::new(|kind: ErrorKind| kind.is_retryable_by_default()),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("timeout", &self.timeout)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Replace the retry predicate
    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(ErrorKind) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        (self.should_retry)(kind)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `initial_delay * 2^(attempt - 1)`, capped at `max_delay`, with
    /// jitter applied after the cap.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if self.jitter == 0.0 {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let jitter_range = base_secs * self.jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        Duration::from_secs_f64((base_secs + jitter).max(0.0))
    }

    /// Validate the policy
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be greater than 0".to_string());
        }
        if self.initial_delay > self.max_delay {
            return Err("initial_delay must not exceed max_delay".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

/// Client for the boundary channel
#[derive(Clone)]
pub struct MessagingClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    error_log: Arc<ErrorLog>,
}

impl MessagingClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, error_log: Arc<ErrorLog>) -> Self {
        Self {
            transport,
            policy,
            error_log,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn error_log(&self) -> &Arc<ErrorLog> {
        &self.error_log
    }

    /// Send a request and return its raw result payload
    pub async fn send(&self, request: Request) -> Result<serde_json::Value> {
        let name = request.name();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("Sending {} (attempt {}/{})", name, attempt, max_attempts);

            let outcome = match tokio::time::timeout(
                self.policy.timeout,
                self.transport.call(request.clone()),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(Failure::timeout(format!(
                    "{} timed out after {}ms",
                    name,
                    self.policy.timeout.as_millis()
                ))),
            };

            let failure = match outcome {
                Ok(envelope) if envelope.ok => {
                    return Ok(envelope.result.unwrap_or(serde_json::Value::Null));
                }
                Ok(envelope) => {
                    let message = envelope
                        .error
                        .unwrap_or_else(|| format!("{} failed without an error message", name));
                    self.record_failure(name, ErrorKind::Permanent, &message, attempt, false);
                    warn!("{} rejected by remote side: {}", name, message);
                    return Err(SyncError::Rejected(message));
                }
                Err(failure) => failure,
            };

            let kind = classify(Some(&failure));
            let message = failure.to_string();
            let will_retry = attempt < max_attempts && self.policy.should_retry(kind);
            self.record_failure(name, kind, &message, attempt, will_retry);

            if !will_retry {
                error!(
                    "{} failed ({}) after {} attempt(s): {}",
                    name, kind, attempt, message
                );
                return Err(SyncError::Boundary {
                    kind,
                    message,
                    attempts: attempt,
                });
            }

            let delay = self.policy.next_delay(attempt);
            warn!(
                "{} failed ({}) (attempt {}/{}), retrying after {:?}",
                name, kind, attempt, max_attempts, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Send a request and decode its result payload
    pub async fn request<R: DeserializeOwned>(&self, request: Request) -> Result<R> {
        let value = self.send(request).await?;
        serde_json::from_value(value).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    /// Health check message
    pub async fn health(&self) -> Result<HealthResponse> {
        self.request(Request::Health).await
    }

    /// Get-many message
    pub async fn get_many(&self, ids: Vec<String>) -> Result<HashMap<String, Record>> {
        let response: GetManyResponse = self.request(Request::GetMany { ids }).await?;
        Ok(response.records)
    }

    /// Set-state message
    pub async fn set_state(
        &self,
        id: impl Into<String>,
        state: ItemState,
        title: impl Into<String>,
    ) -> Result<Option<Record>> {
        let response: SetStateResponse = self
            .request(Request::SetState {
                id: id.into(),
                state,
                title: title.into(),
            })
            .await?;
        Ok(response.record)
    }

    fn record_failure(&self, name: &str, kind: ErrorKind, message: &str, attempt: u32, will_retry: bool) {
        let mut metadata = HashMap::new();
        metadata.insert("attempt".to_string(), attempt.to_string());
        metadata.insert("max_attempts".to_string(), self.policy.max_attempts.to_string());
        metadata.insert("will_retry".to_string(), will_retry.to_string());
        self.error_log
            .record(kind, message, format!("send:{}", name), metadata);
    }
}
