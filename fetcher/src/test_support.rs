//! Deterministic test doubles for the controller's collaborators.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::core::budget::Deadline;
use crate::core::types::{ChatMessage, Outcome};
use crate::error::ModelError;
use crate::io::clock::Clock;
use crate::io::log_sink::LogSink;
use crate::io::model::LanguageModel;
use crate::io::sandbox::Sandbox;

/// Replays canned chat replies in order and records every request.
///
/// Once the script runs out, calls fail with a fatal error.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModelError>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    timeouts: Mutex<Vec<Duration>>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = Result<String, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Messages of every call so far, in call order.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().expect("timeouts lock").clone()
    }

    /// Replies not consumed yet.
    pub fn remaining(&self) -> usize {
        self.replies.lock().expect("replies lock").len()
    }
}

impl LanguageModel for ScriptedModel {
    fn chat(&self, messages: &[ChatMessage], timeout: Duration) -> Result<String, ModelError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(messages.to_vec());
        self.timeouts.lock().expect("timeouts lock").push(timeout);
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Fatal("scripted model exhausted".to_string())))
    }
}

/// Returns canned outcomes in order and records the executed code.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    outcomes: Mutex<VecDeque<Outcome>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedSandbox {
    pub fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed lock").clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute(&self, code: &str, _deadline: &Deadline) -> Outcome {
        self.executed
            .lock()
            .expect("executed lock")
            .push(code.to_string());
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or_else(|| Outcome::failure("scripted sandbox exhausted", ""))
    }
}

/// Keeps every agent log line in memory.
#[derive(Debug, Default)]
pub struct RecordingLogSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("messages lock").clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages
            .lock()
            .expect("messages lock")
            .iter()
            .any(|m| m.contains(needle))
    }
}

impl LogSink for RecordingLogSink {
    fn append_log(&self, message: &str) {
        self.messages
            .lock()
            .expect("messages lock")
            .push(message.to_string());
    }
}

/// Always reports the same time.
#[derive(Debug, Clone)]
pub struct FixedClock(String);

impl FixedClock {
    pub fn new(now: impl Into<String>) -> Self {
        Self(now.into())
    }
}

impl Clock for FixedClock {
    fn now_string(&self) -> String {
        self.0.clone()
    }
}

/// A typical code-author reply: prose plus one python block.
pub fn code_response(code: &str) -> String {
    format!("Here is the script:\n\n```python\n{code}\n```\n")
}

/// A critic reply in the wrapped JSON shape.
pub fn verdict_response(is_pass: bool, thoughts: &str, code_improve: &str) -> String {
    serde_json::json!({
        "result": {
            "is_pass": is_pass,
            "thoughts": thoughts,
            "code_improve": code_improve,
        }
    })
    .to_string()
}
