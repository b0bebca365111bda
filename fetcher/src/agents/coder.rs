//! Code-authoring agent: prompt, completion, code-fence extraction.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::budget::Deadline;
use crate::core::code_block::{Extraction, extract_code};
use crate::core::types::{ChatMessage, CycleState, FetchRequest};
use crate::io::model::LanguageModel;
use crate::io::prompt::PromptBuilder;

use super::{AgentError, model_failure};

/// Everything one generation step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub prompt: String,
    pub response: String,
    pub code: String,
    pub extraction: Extraction,
}

#[derive(Debug, Clone)]
pub struct CodeAgent {
    prompts: PromptBuilder,
    request_timeout: Duration,
}

impl CodeAgent {
    pub fn new(prompts: PromptBuilder, request_timeout: Duration) -> Self {
        Self {
            prompts,
            request_timeout,
        }
    }

    /// Author the next attempt of `cycle`.
    ///
    /// The first attempt uses the initial prompt; later ones reflect on the
    /// last attempt and the last verdict.
    #[instrument(skip_all, fields(iteration = cycle.iteration()))]
    pub fn generate<M: LanguageModel + ?Sized>(
        &self,
        model: &M,
        request: &FetchRequest,
        current_time: &str,
        cycle: &CycleState,
        deadline: &Deadline,
    ) -> Result<Generation, AgentError> {
        let pack = match cycle.last_attempt() {
            None => self.prompts.build_initial(request, current_time),
            Some(previous) => self.prompts.build_reflective(
                request,
                current_time,
                previous,
                cycle.last_verdict(),
            ),
        }
        .map_err(|err| AgentError::Prompt(format!("{err:#}")))?;
        let prompt = pack.render();

        let timeout = deadline
            .clip(self.request_timeout)
            .map_err(AgentError::Budget)?;
        let response = model
            .chat(&[ChatMessage::user(prompt.as_str())], timeout)
            .map_err(|err| model_failure(err, deadline))?;

        let (code, extraction) = extract_code(&response);
        if extraction == Extraction::Raw {
            warn!("reply had no code fence, using it verbatim");
        }
        debug!(code_bytes = code.len(), ?extraction, "extracted attempt code");
        Ok(Generation {
            prompt,
            response,
            code,
            extraction,
        })
    }
}
