//! Prompt rendering for code generation and critique.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::compare::preview;
use crate::core::types::{Attempt, FetchRequest, Outcome, Verdict};

const INITIAL_TEMPLATE: &str = include_str!("prompts/initial.md");
const REFLECTIVE_TEMPLATE: &str = include_str!("prompts/reflective.md");
const CRITIQUE_TEMPLATE: &str = include_str!("prompts/critique.md");

/// Appended to a section cut short for the byte budget.
const TRUNCATED_MARKER: &str = "\n[truncated]";

/// Droppable sections that would shrink below this are removed instead.
const MIN_SECTION_BYTES: usize = 64;

/// Droppable sections shrink in this order when a prompt is over budget.
const GENERATION_SHRINK_ORDER: &[&str] = &["docs", "outcome", "notes"];
const CRITIQUE_SHRINK_ORDER: &[&str] = &["docs"];

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("initial", INITIAL_TEMPLATE)
        .expect("initial template should be valid");
    env.add_template("reflective", REFLECTIVE_TEMPLATE)
        .expect("reflective template should be valid");
    env.add_template("critique", CRITIQUE_TEMPLATE)
        .expect("critique template should be valid");
    env
});

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should compile")
});

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    /// Required sections are never shrunk by key.
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Bring sections under `budget` bytes.
///
/// Droppable sections named in `shrink_order` are cut down first (or removed
/// when little would remain); the last section is truncated as a last resort.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize, shrink_order: &[&str]) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in shrink_order {
        let total = total_len(sections);
        if total <= budget {
            return;
        }
        let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) else {
            continue;
        };
        let excess = total - budget;
        let before_len = sections[idx].content.len();
        if before_len <= excess + MIN_SECTION_BYTES {
            debug!(section = key, bytes_dropped = before_len, "dropped section for budget");
            sections.remove(idx);
        } else {
            let section = &mut sections[idx];
            truncate_with_marker(&mut section.content, before_len - excess);
            debug!(
                section = key,
                before_len,
                after_len = section.content.len(),
                "truncated section for budget"
            );
        }
    }

    let total = total_len(sections);
    if total > budget
        && let Some(last) = sections.last_mut()
    {
        let other_len = total - last.content.len();
        let allowed = budget.saturating_sub(other_len);
        let before_len = last.content.len();
        truncate_with_marker(&mut last.content, allowed);
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated last section for budget"
        );
    }
}

/// Cut `content` to at most `max_len` bytes on a char boundary, marking the cut.
fn truncate_with_marker(content: &mut String, max_len: usize) {
    if content.len() <= max_len {
        return;
    }
    if max_len > TRUNCATED_MARKER.len() {
        content.truncate(floor_char_boundary(content, max_len - TRUNCATED_MARKER.len()));
        content.push_str(TRUNCATED_MARKER);
    } else {
        content.truncate(floor_char_boundary(content, max_len));
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn non_empty(text: &str) -> Option<&str> {
    Some(text.trim()).filter(|s| !s.is_empty())
}

/// Renders the three prompt variants within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
    preview_chars: usize,
}

impl PromptBuilder {
    /// `preview_chars` bounds how much of an outcome any prompt shows.
    pub fn new(budget_bytes: usize, preview_chars: usize) -> Self {
        Self {
            budget_bytes,
            preview_chars,
        }
    }

    /// First attempt of a cycle.
    pub fn build_initial(&self, request: &FetchRequest, current_time: &str) -> Result<PromptPack> {
        let rendered = ENGINE
            .get_template("initial")?
            .render(context! {
                user_query => request.user_query.trim(),
                rewrite_query => request.rewrite_query.trim(),
                current_time => current_time,
                docs => non_empty(&request.doc_snippet),
            })
            .context("render initial prompt")?;
        Ok(self.pack(&rendered, GENERATION_SHRINK_ORDER))
    }

    /// Later attempts: the previous code, a preview of what it produced, and the critique.
    pub fn build_reflective(
        &self,
        request: &FetchRequest,
        current_time: &str,
        previous: &Attempt,
        verdict: Option<&Verdict>,
    ) -> Result<PromptPack> {
        let notes = verdict.map(Verdict::combined_notes).unwrap_or_default();
        let rendered = ENGINE
            .get_template("reflective")?
            .render(context! {
                user_query => request.user_query.trim(),
                rewrite_query => request.rewrite_query.trim(),
                current_time => current_time,
                previous_code => previous.code.trim_end(),
                outcome_preview => preview(&previous.outcome, self.preview_chars),
                notes => non_empty(&notes),
                docs => non_empty(&request.doc_snippet),
            })
            .context("render reflective prompt")?;
        Ok(self.pack(&rendered, GENERATION_SHRINK_ORDER))
    }

    pub fn build_critique(&self, doc_snippet: &str, outcome: &Outcome, code: &str) -> Result<PromptPack> {
        let rendered = ENGINE
            .get_template("critique")?
            .render(context! {
                outcome_preview => preview(outcome, self.preview_chars),
                code => code.trim_end(),
                docs => non_empty(doc_snippet),
            })
            .context("render critique prompt")?;
        Ok(self.pack(&rendered, CRITIQUE_SHRINK_ORDER))
    }

    fn pack(&self, rendered: &str, shrink_order: &[&str]) -> PromptPack {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes, shrink_order);
        PromptPack {
            content: render_sections(&sections),
        }
    }
}

/// A rendered prompt ready to send to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    content: String,
}

impl PromptPack {
    pub fn render(&self) -> String {
        self.content.clone()
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }
}
