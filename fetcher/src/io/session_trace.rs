//! Per-attempt session artifacts under `<trace_dir>/<session>/`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::core::types::{FetchRequest, FetchResult, Outcome, Verdict};

/// Sessions sharing a directory name get a numeric suffix, up to this many.
const MAX_NAME_COLLISIONS: u32 = 100;

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub response_path: PathBuf,
    pub code_path: PathBuf,
    pub outcome_path: PathBuf,
    pub critique_prompt_path: PathBuf,
    pub verdict_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(session_dir: &Path, cycle: u32, attempt: u32) -> Self {
        let dir = session_dir
            .join(format!("cycle-{cycle}"))
            .join(format!("attempt-{attempt}"));
        Self {
            prompt_path: dir.join("prompt.md"),
            response_path: dir.join("response.md"),
            code_path: dir.join("code.py"),
            outcome_path: dir.join("outcome.json"),
            critique_prompt_path: dir.join("critique_prompt.md"),
            verdict_path: dir.join("verdict.json"),
            dir,
        }
    }
}

#[derive(Debug, Serialize)]
struct VerdictRecord<'a> {
    verdict: &'a Verdict,
    raw_reply: &'a str,
}

/// On-disk record of one session.
#[derive(Debug, Clone)]
pub struct SessionTrace {
    dir: PathBuf,
}

impl SessionTrace {
    /// Create a fresh session directory and record the request.
    pub fn create(trace_dir: &Path, request: &FetchRequest) -> Result<Self> {
        fs::create_dir_all(trace_dir)
            .with_context(|| format!("create trace dir {}", trace_dir.display()))?;
        let base = session_name(request);
        let mut dir = trace_dir.join(&base);
        let mut suffix = 0u32;
        loop {
            match fs::create_dir(&dir) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    suffix += 1;
                    if suffix > MAX_NAME_COLLISIONS {
                        bail!("too many sessions named {base} in {}", trace_dir.display());
                    }
                    dir = trace_dir.join(format!("{base}-{suffix}"));
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create session dir {}", dir.display()));
                }
            }
        }
        let trace = Self { dir };
        write_json(&trace.dir.join("request.json"), request)?;
        Ok(trace)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn attempt_paths(&self, cycle: u32, attempt: u32) -> AttemptPaths {
        AttemptPaths::new(&self.dir, cycle, attempt)
    }

    /// Prompt, raw reply and extracted code of one attempt.
    pub fn write_generation(
        &self,
        cycle: u32,
        attempt: u32,
        prompt: &str,
        response: &str,
        code: &str,
    ) -> Result<AttemptPaths> {
        let paths = self.attempt_paths(cycle, attempt);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;
        write_text(&paths.prompt_path, prompt)?;
        write_text(&paths.response_path, response)?;
        write_text(&paths.code_path, code)?;
        Ok(paths)
    }

    pub fn write_outcome(&self, cycle: u32, attempt: u32, outcome: &Outcome) -> Result<()> {
        let paths = self.attempt_paths(cycle, attempt);
        write_json(&paths.outcome_path, outcome)
    }

    pub fn write_critique(
        &self,
        cycle: u32,
        attempt: u32,
        prompt: &str,
        verdict: &Verdict,
        raw_reply: &str,
    ) -> Result<()> {
        let paths = self.attempt_paths(cycle, attempt);
        write_text(&paths.critique_prompt_path, prompt)?;
        write_json(&paths.verdict_path, &VerdictRecord { verdict, raw_reply })
    }

    pub fn write_result(&self, result: &FetchResult) -> Result<PathBuf> {
        let path = self.dir.join("result.json");
        write_json(&path, result)?;
        Ok(path)
    }
}

/// `<utc timestamp>-<8 hex of the request>`.
fn session_name(request: &FetchRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.user_query.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.rewrite_query.as_bytes());
    let hash = hex::encode(hasher.finalize());
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &hash[..8])
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
