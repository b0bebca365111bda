//! Fetcher configuration stored in `fetcher.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "fetcher.toml";

/// Upper bound for every configured timeout: one week.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Fetcher configuration (TOML).
///
/// This file is intended to be edited by humans. Missing sections and fields
/// fall back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub controller: ControllerConfig,
    pub model: ModelConfig,
    pub retry: RetryConfig,
    pub sandbox: SandboxConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Attempts per reflection cycle when the caller does not override it.
    pub max_iterations: u32,

    /// Outer retries before the final unconditional cycle.
    pub max_retries: u32,

    /// Characters of a previous outcome shown in the reflective prompt.
    pub preview_chars: usize,

    /// Upper bound for a rendered prompt; droppable sections go first.
    pub prompt_budget_bytes: usize,

    /// Wall-clock budget for one whole `run` call.
    pub session_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_retries: 3,
            preview_chars: 1000,
            prompt_budget_bytes: 40_000,
            session_timeout_secs: 15 * 60,
        }
    }
}

impl ControllerConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Root of an OpenAI-compatible API, without the `/chat/completions` suffix.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the bearer token.
    pub api_key_env: String,
    pub temperature: f64,
    pub top_p: f64,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.2,
            top_p: 0.95,
            request_timeout_secs: 120,
        }
    }
}

impl ModelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total calls per completion, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter command; the harness path and its arguments are appended.
    pub interpreter: Vec<String>,

    /// Wall-clock ceiling per attempt.
    pub timeout_secs: u64,

    /// `RLIMIT_CPU` applied in the child (0 disables).
    pub cpu_limit_secs: u64,

    /// `RLIMIT_AS` applied in the child (0 disables).
    pub memory_limit_mb: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Top-level modules the code may import. Empty allows everything.
    pub allowed_modules: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-I".to_string()],
            timeout_secs: 120,
            cpu_limit_secs: 120,
            memory_limit_mb: 2048,
            output_limit_bytes: 100_000,
            allowed_modules: Vec::new(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Agent log file. Unset sends agent log lines to tracing.
    pub file: Option<PathBuf>,

    /// Recent agent log lines kept in memory.
    pub max_lines: usize,

    /// Directory for per-attempt session traces. Unset disables tracing to disk.
    pub trace_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            max_lines: 1000,
            trace_dir: None,
        }
    }
}

impl FetchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.controller.max_iterations == 0 {
            return Err(anyhow!("controller.max_iterations must be > 0"));
        }
        if self.controller.session_timeout_secs == 0 {
            return Err(anyhow!("controller.session_timeout_secs must be > 0"));
        }
        if self.controller.prompt_budget_bytes == 0 {
            return Err(anyhow!("controller.prompt_budget_bytes must be > 0"));
        }
        if self.model.base_url.trim().is_empty() {
            return Err(anyhow!("model.base_url must be set"));
        }
        if self.model.model.trim().is_empty() {
            return Err(anyhow!("model.model must be set"));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(anyhow!("model.request_timeout_secs must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(anyhow!(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms"
            ));
        }
        if self.sandbox.interpreter.is_empty() || self.sandbox.interpreter[0].trim().is_empty() {
            return Err(anyhow!("sandbox.interpreter must be a non-empty array"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        for (key, secs) in [
            ("controller.session_timeout_secs", self.controller.session_timeout_secs),
            ("model.request_timeout_secs", self.model.request_timeout_secs),
            ("sandbox.timeout_secs", self.sandbox.timeout_secs),
            ("sandbox.cpu_limit_secs", self.sandbox.cpu_limit_secs),
        ] {
            if secs > MAX_TIMEOUT_SECS {
                return Err(anyhow!("{key} must be <= {MAX_TIMEOUT_SECS}"));
            }
        }
        if self.log.max_lines == 0 {
            return Err(anyhow!("log.max_lines must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FetchConfig::default()`.
pub fn load_config(path: &Path) -> Result<FetchConfig> {
    if !path.exists() {
        let cfg = FetchConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FetchConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FetchConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
