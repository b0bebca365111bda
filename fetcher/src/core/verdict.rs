//! Critic reply parsing: narrow repair, then a fixed JSON Schema.
//!
//! Model output drifts in small ways: markdown fences, trailing commas, smart
//! quotes, raw line breaks inside strings, Python literals (`'key'`, `True`,
//! `None`) and a `{"result": {...}}` wrapper. Those are repaired. Anything
//! else that fails the schema is a parse failure, and the caller decides what
//! verdict to substitute.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::Value;

use crate::core::types::Verdict;

const VERDICT_SCHEMA: &str = include_str!("../../schemas/verdict.schema.json");

static VERDICT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(VERDICT_SCHEMA).expect("verdict schema should be valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("verdict schema should compile")
});

#[derive(Debug, Deserialize)]
struct VerdictJson {
    is_pass: bool,
    thoughts: String,
    #[serde(default)]
    code_improve: String,
}

/// Parse a critic reply into a verdict.
pub fn parse_verdict(reply: &str) -> Result<Verdict> {
    let clean = strip_markdown_fences(reply);
    let fragment = extract_json_object(clean)
        .ok_or_else(|| anyhow!("no json object in critic reply"))?;
    let repaired = fix_json_issues(fragment);
    let parsed: Value = serde_json::from_str(&repaired).context("parse critic json")?;
    let body = unwrap_result(parsed);
    validate_schema(&body)?;
    let verdict: VerdictJson = serde_json::from_value(body).context("decode verdict")?;
    Ok(Verdict {
        is_pass: verdict.is_pass,
        thoughts: verdict.thoughts,
        improvement_notes: verdict.code_improve,
    })
}

/// Strip a surrounding markdown fence (```json or bare ```).
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Outermost `{ ... }` span of the text.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start <= end).then(|| &text[start..=end])
}

/// Rewrite near-JSON into JSON in one pass that tracks string literals.
///
/// Outside strings: single quotes open strings, Python literals become JSON
/// literals, commas before a closing bracket are dropped, and stray control
/// characters are removed. Inside strings: control characters are escaped and
/// quotes foreign to the literal's delimiter are balanced.
fn fix_json_issues(json: &str) -> String {
    let normalized = json
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    let chars: Vec<char> = normalized.chars().collect();
    let mut out = String::with_capacity(normalized.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => i = copy_string(&chars, i, &mut out),
            ',' if next_significant(&chars, i + 1).is_some_and(|n| n == '}' || n == ']') => {
                i += 1;
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            c if c.is_control() && !c.is_ascii_whitespace() => i += 1,
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Copy the string literal opening at `start` as a double-quoted JSON string.
///
/// Returns the index just past the closing delimiter, or the end of input
/// for an unterminated literal.
fn copy_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let delim = chars[start];
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => match chars.get(i + 1) {
                Some('\'') => {
                    out.push('\'');
                    i += 2;
                }
                Some(&next) => {
                    out.push('\\');
                    out.push(next);
                    i += 2;
                }
                None => {
                    out.push_str("\\\\");
                    i += 1;
                }
            },
            c if c == delim => {
                out.push('"');
                return i + 1;
            }
            '"' => {
                out.push_str("\\\"");
                i += 1;
            }
            '\n' => {
                out.push_str("\\n");
                i += 1;
            }
            '\r' => {
                out.push_str("\\r");
                i += 1;
            }
            '\t' => {
                out.push_str("\\t");
                i += 1;
            }
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", u32::from(c)));
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    i
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}

/// Accept both `{"result": {...}}` and a bare verdict object.
fn unwrap_result(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.get("result").is_some_and(Value::is_object) => map
            .remove("result")
            .unwrap_or(Value::Object(serde_json::Map::new())),
        other => other,
    }
}

fn validate_schema(instance: &Value) -> Result<()> {
    let messages: Vec<String> = VERDICT_VALIDATOR
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("verdict schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
