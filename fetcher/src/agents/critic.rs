//! Critique agent: asks the model whether an outcome satisfies the data need.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::budget::Deadline;
use crate::core::types::{ChatMessage, Outcome, Verdict};
use crate::core::verdict::parse_verdict;
use crate::io::model::LanguageModel;
use crate::io::prompt::PromptBuilder;

use super::{AgentError, model_failure};

/// Critique prompt, raw reply, and the verdict drawn from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Critique {
    pub prompt: String,
    pub reply: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone)]
pub struct Critic {
    prompts: PromptBuilder,
    request_timeout: Duration,
}

impl Critic {
    pub fn new(prompts: PromptBuilder, request_timeout: Duration) -> Self {
        Self {
            prompts,
            request_timeout,
        }
    }

    /// Judge `outcome` of `code` against the documentation it was written for.
    ///
    /// An unparseable reply yields [`Verdict::parse_error`], never an error.
    #[instrument(skip_all, fields(failure = outcome.is_failure()))]
    pub fn critique<M: LanguageModel + ?Sized>(
        &self,
        model: &M,
        doc_snippet: &str,
        outcome: &Outcome,
        code: &str,
        deadline: &Deadline,
    ) -> Result<Critique, AgentError> {
        let prompt = self
            .prompts
            .build_critique(doc_snippet, outcome, code)
            .map_err(|err| AgentError::Prompt(format!("{err:#}")))?
            .render();

        let timeout = deadline
            .clip(self.request_timeout)
            .map_err(AgentError::Budget)?;
        let reply = model
            .chat(&[ChatMessage::user(prompt.as_str())], timeout)
            .map_err(|err| model_failure(err, deadline))?;

        let verdict = match parse_verdict(&reply) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(err = %err, "could not parse critic reply");
                debug!(reply = %reply, "raw critic reply");
                Verdict::parse_error()
            }
        };
        debug!(is_pass = verdict.is_pass, "critique finished");
        Ok(Critique {
            prompt,
            reply,
            verdict,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::budget::CancelToken;
    use crate::test_support::{ScriptedModel, verdict_response};

    fn critic() -> Critic {
        Critic::new(PromptBuilder::new(40_000, 1000), Duration::from_secs(30))
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(60), CancelToken::new())
    }

    #[test]
    fn passing_verdict() {
        let model = ScriptedModel::new([Ok(verdict_response(true, "five closes", ""))]);
        let critique = critic()
            .critique(
                &model,
                "docs",
                &Outcome::value(json!([1, 2, 3, 4, 5])),
                "result = closes()",
                &deadline(),
            )
            .expect("critique");
        assert!(critique.verdict.is_pass);
        assert_eq!(critique.verdict.thoughts, "five closes");

        let prompt = &model.calls()[0][0].content;
        assert!(prompt.contains("[1,2,3,4,5]"));
        assert!(prompt.contains("result = closes()"));
    }

    #[test]
    fn unparseable_reply_becomes_parse_error_verdict() {
        let model = ScriptedModel::new([Ok("Looks fine to me!".to_string())]);
        let critique = critic()
            .critique(&model, "", &Outcome::empty(), "x = 1", &deadline())
            .expect("critique");
        assert!(critique.verdict.is_parse_error());
        assert_eq!(critique.reply, "Looks fine to me!");
    }

    #[test]
    fn failure_outcome_is_still_judged() {
        let model = ScriptedModel::new([Ok(verdict_response(
            false,
            "the call raised KeyError",
            "use the 'close' column",
        ))]);
        let critique = critic()
            .critique(
                &model,
                "docs",
                &Outcome::failure("KeyError: 'Close'", "Traceback"),
                "result = df['Close']",
                &deadline(),
            )
            .expect("critique");
        assert!(!critique.verdict.is_pass);
        assert_eq!(critique.verdict.improvement_notes, "use the 'close' column");
        assert!(model.calls()[0][0].content.contains("KeyError"));
    }
}
