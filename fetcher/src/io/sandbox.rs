//! Execution of model-authored code.
//!
//! A [`Sandbox`] never fails past its boundary: every problem while running an
//! attempt comes back as [`Outcome::Failure`] so the controller can treat it as
//! an ordinary attempt.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::budget::{CancelToken, Deadline};
use crate::core::types::Outcome;
use crate::io::config::SandboxConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};

const HARNESS: &str = include_str!("harness.py");

/// Runs one code string and reports what it left under `result`.
pub trait Sandbox: Send + Sync {
    fn execute(&self, code: &str, deadline: &Deadline) -> Outcome;
}

/// Fresh interpreter process per attempt, driven by an embedded harness.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn run(&self, code: &str, timeout: Duration, cancel: &CancelToken) -> Result<Outcome> {
        let dir = tempfile::tempdir().context("create sandbox dir")?;
        let harness_path = dir.path().join("harness.py");
        let code_path = dir.path().join("attempt.py");
        let envelope_path = dir.path().join("envelope.json");
        fs::write(&harness_path, HARNESS).context("write sandbox harness")?;
        fs::write(&code_path, code).context("write attempt code")?;

        let (program, args) = self
            .config
            .interpreter
            .split_first()
            .ok_or_else(|| anyhow!("sandbox interpreter is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&harness_path)
            .arg(&code_path)
            .arg(&envelope_path)
            .arg(self.config.cpu_limit_secs.to_string())
            .arg(self.config.memory_limit_mb.to_string())
            .arg(self.config.allowed_modules.join(","))
            .current_dir(dir.path());

        let output = match run_command_with_timeout(
            cmd,
            timeout,
            self.config.output_limit_bytes,
            Some(cancel),
        ) {
            Ok(output) => output,
            Err(err) => {
                return Ok(Outcome::failure(
                    format!("failed to run sandbox interpreter: {err:#}"),
                    "",
                ));
            }
        };
        debug!(
            exit_code = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            "sandbox process finished"
        );

        if output.timed_out {
            return Ok(Outcome::failure(
                format!("execution timed out after {:.1}s", timeout.as_secs_f64()),
                diagnostics(&output),
            ));
        }
        if output.cancelled {
            return Ok(Outcome::failure("execution cancelled", diagnostics(&output)));
        }
        Ok(read_envelope(&envelope_path, &output))
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(code_bytes = code.len()))]
    fn execute(&self, code: &str, deadline: &Deadline) -> Outcome {
        let timeout = match deadline.clip(self.config.timeout()) {
            Ok(timeout) => timeout,
            Err(exhausted) => {
                return Outcome::failure(format!("execution skipped: {exhausted}"), "");
            }
        };
        match self.run(code, timeout, deadline.cancel_token()) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(err = %err, "sandbox setup failed");
                Outcome::failure(format!("sandbox setup failed: {err:#}"), "")
            }
        }
    }
}

fn read_envelope(path: &Path, output: &CommandOutput) -> Outcome {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => {
            let status = output
                .status
                .code()
                .map_or_else(|| "a signal".to_string(), |code| format!("status {code}"));
            return Outcome::failure(
                format!("interpreter exited with {status} without reporting a result"),
                diagnostics(output),
            );
        }
    };
    parse_envelope(&text).unwrap_or_else(|err| {
        warn!(err = %err, "malformed sandbox envelope");
        Outcome::failure(format!("malformed sandbox envelope: {err:#}"), diagnostics(output))
    })
}

/// Decode `{"status":"ok","result":..}` or `{"status":"error","message":..,"trace":..}`.
fn parse_envelope(text: &str) -> Result<Outcome> {
    let envelope: Value = serde_json::from_str(text).context("parse envelope json")?;
    match envelope.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(envelope
            .get("result")
            .cloned()
            .map_or_else(Outcome::empty, Outcome::value)),
        Some("error") => {
            let field = |name: &str| {
                envelope
                    .get(name)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            Ok(Outcome::failure(field("message"), field("trace")))
        }
        other => bail!("unexpected envelope status {other:?}"),
    }
}

fn diagnostics(output: &CommandOutput) -> String {
    let mut text = output.stderr_lossy();
    text.push_str(&output.stderr_truncated_notice("sandbox"));
    text
}
