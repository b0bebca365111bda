//! Chat-completion collaborators.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::ChatMessage;
use crate::error::ModelError;
use crate::io::config::ModelConfig;

/// Error bodies quoted in errors are cut to this many characters.
const ERROR_BODY_LIMIT: usize = 500;

/// Blocking, single-response chat completion.
pub trait LanguageModel: Send + Sync {
    /// Send `messages` and return the assistant's reply text.
    ///
    /// `timeout` bounds this call; implementations must not block past it.
    fn chat(&self, messages: &[ChatMessage], timeout: Duration) -> Result<String, ModelError>;
}

impl<M: LanguageModel + ?Sized> LanguageModel for &M {
    fn chat(&self, messages: &[ChatMessage], timeout: Duration) -> Result<String, ModelError> {
        (**self).chat(messages, timeout)
    }
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
    temperature: f64,
    top_p: f64,
    request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    top_p: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChatClient {
    /// Build a client, resolving the API key from `config.api_key_env`.
    ///
    /// A missing key is reported on the first call, not here, so sandbox-only
    /// commands work without credentials.
    pub fn from_env(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        Self::new(config, api_key)
    }

    pub fn new(config: &ModelConfig, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            api_key_env: config.api_key_env.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            request_timeout: config.request_timeout(),
        })
    }
}

impl LanguageModel for OpenAiChatClient {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    fn chat(&self, messages: &[ChatMessage], timeout: Duration) -> Result<String, ModelError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ModelError::Fatal(format!("api key env var {} is not set", self.api_key_env))
        })?;
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            top_p: self.top_p,
        };

        debug!(endpoint = %self.endpoint, "sending chat completion request");
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .timeout(timeout.min(self.request_timeout))
            .json(&request)
            .send()
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, response));
        }

        let body: ChatResponse = response
            .json()
            .map_err(|e| ModelError::Fatal(format!("failed to parse response: {e}")))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ModelError::Fatal("response carried no message content".to_string()))?;
        debug!(reply_chars = content.chars().count(), "chat completion received");
        Ok(content)
    }
}

fn classify_send_error(err: reqwest::Error) -> ModelError {
    if err.is_builder() {
        ModelError::Fatal(format!("invalid request: {err}"))
    } else {
        ModelError::Transient(format!("request failed: {err}"))
    }
}

fn classify_status(status: StatusCode, response: Response) -> ModelError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return ModelError::RateLimited { retry_after };
    }
    let body = response
        .text()
        .unwrap_or_else(|_| "Unknown".to_string())
        .chars()
        .take(ERROR_BODY_LIMIT)
        .collect::<String>();
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ModelError::Transient(format!("server error {status}: {body}"))
    } else {
        ModelError::Fatal(format!("api error {status}: {body}"))
    }
}
