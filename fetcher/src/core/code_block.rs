//! Code-fence extraction from free-text model replies.

use std::sync::LazyLock;

use regex::Regex;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[^\n]*\n(.*?)(?:```|\z)")
        .expect("fence regex should compile")
});

/// How a code string was recovered from a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    /// A block tagged `python` or `py`.
    Python,
    /// The first fenced block with some other (or no) tag.
    Fenced,
    /// No fence at all; the trimmed reply is used as-is.
    Raw,
}

/// Pull the code to execute out of a model reply.
///
/// Preference: first python-tagged block, then the first fenced block of any
/// tag. An unterminated fence runs to the end of the reply.
pub fn extract_code(reply: &str) -> (String, Extraction) {
    let mut first_fenced: Option<String> = None;
    for caps in FENCE_RE.captures_iter(reply) {
        let tag = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let body = body.trim_end().to_string();
        if tag.eq_ignore_ascii_case("python") || tag.eq_ignore_ascii_case("py") {
            return (body, Extraction::Python);
        }
        if first_fenced.is_none() {
            first_fenced = Some(body);
        }
    }
    match first_fenced {
        Some(body) => (body, Extraction::Fenced),
        None => (reply.trim().to_string(), Extraction::Raw),
    }
}
