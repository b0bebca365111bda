//! Canonical outcome strings, digests, and within-cycle duplicate detection.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::core::types::{Attempt, Outcome};

/// Equality key for an outcome. Only ever compared, never used as an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compact JSON with object keys sorted at every depth.
///
/// Failures canonicalize as `{"error":...,"trace":...}` so a failing attempt
/// can still be compared and measured like any other outcome.
pub fn canonical_string(outcome: &Outcome) -> String {
    let mut buf = String::new();
    match outcome {
        Outcome::Value { value } => write_canonical(value, &mut buf),
        Outcome::Failure { message, trace } => {
            buf.push_str("{\"error\":");
            write_json_string(message, &mut buf);
            buf.push_str(",\"trace\":");
            write_json_string(trace, &mut buf);
            buf.push('}');
        }
    }
    buf
}

fn write_canonical(value: &Value, buf: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            buf.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_json_string(key, buf);
                buf.push(':');
                write_canonical(&map[key.as_str()], buf);
            }
            buf.push('}');
        }
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(item, buf);
            }
            buf.push(']');
        }
        Value::String(s) => write_json_string(s, buf),
        scalar => buf.push_str(&scalar.to_string()),
    }
}

fn write_json_string(s: &str, buf: &mut String) {
    // serde_json escaping keeps the canonical form valid JSON.
    buf.push_str(&Value::String(s.to_string()).to_string());
}

/// Length of the canonical string in characters.
pub fn canonical_len(outcome: &Outcome) -> usize {
    canonical_string(outcome).chars().count()
}

/// Hex SHA-256 of the canonical string.
pub fn digest(outcome: &Outcome) -> Digest {
    let hash = Sha256::digest(canonical_string(outcome).as_bytes());
    Digest(hex::encode(hash))
}

/// Return the earlier attempt in this cycle whose outcome matches `digest`.
pub fn find_duplicate<'a>(attempts: &'a [Attempt], digest: &Digest) -> Option<&'a Attempt> {
    attempts.iter().find(|attempt| &attempt.digest == digest)
}

/// Canonical string cut to at most `max_chars` characters, for prompts and logs.
pub fn preview(outcome: &Outcome, max_chars: usize) -> String {
    let canonical = canonical_string(outcome);
    match canonical.char_indices().nth(max_chars) {
        Some((cut, _)) => canonical[..cut].to_string(),
        None => canonical,
    }
}
