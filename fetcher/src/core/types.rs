//! Shared deterministic types for the fetch controller.
//!
//! These types define stable contracts between core components. They do not
//! depend on external state or I/O and serialize identically across runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::compare::Digest;
use crate::error::FetchError;

/// Inputs for one fetch session. Immutable for the life of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// The question as the user asked it.
    pub user_query: String,
    /// Upstream rewrite of the question into a concrete data need.
    pub rewrite_query: String,
    /// Pre-selected API documentation for the code author and the critic.
    pub doc_snippet: String,
    /// Attempts allowed per reflection cycle (must be >= 1).
    pub max_iterations: u32,
    /// Bounded outer retries before the final unconditional cycle.
    pub max_retries: u32,
}

impl FetchRequest {
    pub fn new(
        user_query: impl Into<String>,
        rewrite_query: impl Into<String>,
        doc_snippet: impl Into<String>,
        max_iterations: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            user_query: user_query.into(),
            rewrite_query: rewrite_query.into(),
            doc_snippet: doc_snippet.into(),
            max_iterations,
            max_retries,
        }
    }

    pub fn validate(&self) -> Result<(), FetchError> {
        if self.max_iterations < 1 {
            return Err(FetchError::InvalidRequest(
                "max_iterations must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of executing one code string in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The value the code left under `result` (or the empty sentinel).
    Value { value: Value },
    /// Anything that went wrong while running the code.
    Failure { message: String, trace: String },
}

impl Outcome {
    /// Sentinel used when the executed code never assigned `result`.
    pub fn empty() -> Self {
        Outcome::Value {
            value: Value::Object(Map::new()),
        }
    }

    pub fn value(value: Value) -> Self {
        Outcome::Value { value }
    }

    pub fn failure(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Outcome::Failure {
            message: message.into(),
            trace: trace.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure { .. })
    }
}

/// One generate + execute step within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    /// Position within the cycle, starting at 0.
    pub index: u32,
    pub code: String,
    pub outcome: Outcome,
    pub digest: Digest,
}

/// Critic judgement for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_pass: bool,
    pub thoughts: String,
    pub improvement_notes: String,
}

impl Verdict {
    /// Thoughts marker used when the critic reply could not be parsed.
    pub const PARSE_ERROR: &'static str = "parse_error";

    /// Conservative failing verdict for unparseable critic replies.
    pub fn parse_error() -> Self {
        Self {
            is_pass: false,
            thoughts: Self::PARSE_ERROR.to_string(),
            improvement_notes: String::new(),
        }
    }

    pub fn is_parse_error(&self) -> bool {
        !self.is_pass && self.thoughts == Self::PARSE_ERROR
    }

    /// Thoughts followed by improvement notes, fed to the next reflective prompt.
    pub fn combined_notes(&self) -> String {
        let thoughts = self.thoughts.trim();
        let notes = self.improvement_notes.trim();
        match (thoughts.is_empty(), notes.is_empty()) {
            (true, true) => String::new(),
            (false, true) => thoughts.to_string(),
            (true, false) => notes.to_string(),
            (false, false) => format!("{thoughts}\n{notes}"),
        }
    }
}

/// Attempts and critique state of the active reflection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleState {
    attempts: Vec<Attempt>,
    last_verdict: Option<Verdict>,
}

impl CycleState {
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn last_verdict(&self) -> Option<&Verdict> {
        self.last_verdict.as_ref()
    }

    /// Number of attempts recorded so far (the current iteration count).
    pub fn iteration(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Index the next attempt must carry.
    pub fn next_index(&self) -> u32 {
        self.iteration()
    }

    /// Append an attempt, enforcing contiguous indices and the iteration cap.
    pub fn push(&mut self, attempt: Attempt, max_iterations: u32) -> Result<(), FetchError> {
        if attempt.index != self.next_index() {
            return Err(FetchError::Internal(format!(
                "attempt index {} out of order (expected {})",
                attempt.index,
                self.next_index()
            )));
        }
        if self.iteration() >= max_iterations {
            return Err(FetchError::Internal(format!(
                "cycle already holds {max_iterations} attempts"
            )));
        }
        self.attempts.push(attempt);
        Ok(())
    }

    pub fn record_verdict(&mut self, verdict: Verdict) {
        self.last_verdict = Some(verdict);
    }
}

/// Mutable bookkeeping for one `run` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Outer retries started so far.
    pub retry_count: u32,
    /// The active cycle; replaced wholesale on every retry.
    pub cycle: CycleState,
    /// Set exactly once, when the session ends; `run` returns it.
    pub terminal: Option<FetchResult>,
    /// Attempts executed across all cycles.
    pub total_attempts: u32,
    /// Cycles started so far.
    pub cycles_started: u32,
}

impl SessionState {
    /// Discard the active cycle and everything it remembered.
    pub fn reset_cycle(&mut self) {
        self.cycle = CycleState::default();
    }
}

/// Whether the returned outcome was validated by the critic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// The critic accepted the outcome.
    Validated,
    /// Best-effort pick by the fallback selector; not validated.
    Fallback,
    /// The final cycle produced nothing to return.
    NoResult,
}

/// Why the session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Passed,
    IterationsExhausted,
    DuplicateOutcome,
    TimedOut,
    Cancelled,
}

/// What `run` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResult {
    pub status: FetchStatus,
    pub stop: StopReason,
    /// Absent only when `status` is `no_result`.
    pub outcome: Option<Outcome>,
    /// Code that produced `outcome`.
    pub code: Option<String>,
    /// Reflection cycles started.
    pub cycles: u32,
    /// Attempts executed across all cycles.
    pub attempts: u32,
}

impl FetchResult {
    pub fn is_validated(&self) -> bool {
        self.status == FetchStatus::Validated
    }
}

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a chat-completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}
