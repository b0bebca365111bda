//! Bounded exponential-backoff retries around a [`LanguageModel`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::core::types::ChatMessage;
use crate::error::ModelError;
use crate::io::config::RetryConfig;
use crate::io::model::LanguageModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Retries transient failures of the wrapped model; everything else passes through.
///
/// Waits double from `initial_backoff` up to `max_backoff`. A 429 with a
/// `Retry-After` waits that long instead (still capped). The whole call,
/// waits included, stays inside the `timeout` handed to [`LanguageModel::chat`].
pub struct RetryingModel<M> {
    inner: M,
    policy: RetryPolicy,
    sleep: Sleeper,
}

impl<M> RetryingModel<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            sleep: Arc::new(std::thread::sleep),
        }
    }

    /// Replace the blocking sleep, e.g. to record waits in tests.
    pub fn with_sleeper(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Arc::new(sleep);
        self
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

impl<M: fmt::Debug> fmt::Debug for RetryingModel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingModel")
            .field("inner", &self.inner)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<M: LanguageModel> LanguageModel for RetryingModel<M> {
    fn chat(&self, messages: &[ChatMessage], timeout: Duration) -> Result<String, ModelError> {
        let started = Instant::now();
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let left = timeout.saturating_sub(started.elapsed());
            let err = match self.inner.chat(messages, left) {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };
            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.policy.max_attempts {
                return Err(ModelError::Exhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }

            let wait = match &err {
                ModelError::RateLimited {
                    retry_after: Some(after),
                } => (*after).min(self.policy.max_backoff),
                _ => backoff,
            };
            if started.elapsed() + wait >= timeout {
                return Err(ModelError::Exhausted {
                    attempts: attempt,
                    last: format!("{err} (no time left to retry)"),
                });
            }

            warn!(
                err = %err,
                attempt,
                max_attempts = self.policy.max_attempts,
                wait_ms = wait.as_millis() as u64,
                "completion failed, retrying"
            );
            (self.sleep)(wait);
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }
    }
}
