//! Orchestration of one fetch session: reflection cycles inside bounded retries.
//!
//! A session runs up to `max_retries` cycles that may end in "no result"
//! (a repeated outcome), then one final cycle whose result is returned no
//! matter what. Inside a cycle each attempt is generated, executed, checked
//! for repetition, and critiqued; a passing verdict ends the session.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::agents::AgentError;
use crate::agents::coder::CodeAgent;
use crate::agents::critic::Critic;
use crate::core::budget::{BudgetExhausted, CancelToken, Deadline};
use crate::core::compare::{digest, find_duplicate, preview};
use crate::core::fallback::select_fallback;
use crate::core::types::{
    Attempt, FetchRequest, FetchResult, FetchStatus, Outcome, SessionState, StopReason,
};
use crate::error::FetchError;
use crate::io::clock::Clock;
use crate::io::config::FetchConfig;
use crate::io::log_sink::LogSink;
use crate::io::model::LanguageModel;
use crate::io::prompt::PromptBuilder;
use crate::io::sandbox::Sandbox;
use crate::io::session_trace::SessionTrace;

/// Characters of an outcome quoted in agent log lines.
const LOG_PREVIEW_CHARS: usize = 300;

/// How a single reflection cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    /// The last attempt of the cycle passed critique.
    Passed,
    /// `max_iterations` attempts, none passed.
    IterationsExhausted,
    /// An outcome repeated an earlier one in the same cycle.
    Duplicate,
    /// The session deadline passed or the session was cancelled.
    OutOfBudget(BudgetExhausted),
}

/// Drives generate, execute, critique cycles against borrowed collaborators.
///
/// Holds no per-session state, so one controller can serve many sequential
/// `run` calls; concurrent sessions use one controller per thread.
pub struct ReflectiveFetchController<'a, M: ?Sized, S: ?Sized> {
    model: &'a M,
    sandbox: &'a S,
    log: &'a dyn LogSink,
    clock: &'a dyn Clock,
    coder: CodeAgent,
    critic: Critic,
    session_timeout: Duration,
    preview_chars: usize,
    trace_dir: Option<PathBuf>,
    cancel: CancelToken,
}

impl<'a, M, S> ReflectiveFetchController<'a, M, S>
where
    M: LanguageModel + ?Sized,
    S: Sandbox + ?Sized,
{
    pub fn new(
        model: &'a M,
        sandbox: &'a S,
        log: &'a dyn LogSink,
        clock: &'a dyn Clock,
        config: &FetchConfig,
    ) -> Self {
        let controller = &config.controller;
        let prompts = PromptBuilder::new(controller.prompt_budget_bytes, controller.preview_chars);
        let request_timeout = config.model.request_timeout();
        Self {
            model,
            sandbox,
            log,
            clock,
            coder: CodeAgent::new(prompts.clone(), request_timeout),
            critic: Critic::new(prompts, request_timeout),
            session_timeout: controller.session_timeout(),
            preview_chars: controller.preview_chars,
            trace_dir: config.log.trace_dir.clone(),
            cancel: CancelToken::new(),
        }
    }

    /// Use `token` to cancel sessions from another thread.
    ///
    /// A cancelled token stays cancelled; later sessions end immediately.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_trace_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.trace_dir = dir;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run one session to completion.
    ///
    /// Errors only for an invalid request, a terminal model failure, or a
    /// broken internal invariant. Everything else resolves to a [`FetchResult`].
    #[instrument(skip_all, fields(max_iterations = request.max_iterations, max_retries = request.max_retries))]
    pub fn run(&self, request: &FetchRequest) -> Result<FetchResult, FetchError> {
        request.validate()?;
        let deadline = Deadline::after(self.session_timeout, self.cancel.clone());
        let trace = self.open_trace(request);
        self.log.append_log(&format!(
            "session started: {} (max_iterations={}, max_retries={})",
            request.rewrite_query.trim(),
            request.max_iterations,
            request.max_retries
        ));

        let mut session = SessionState::default();
        while session.terminal.is_none() {
            let final_cycle = session.retry_count >= request.max_retries;
            if final_cycle && request.max_retries > 0 {
                self.log
                    .append_log("retries exhausted, running the final cycle unconditionally");
            }
            session.reset_cycle();
            session.cycles_started += 1;
            info!(cycle = session.cycles_started, final_cycle, "starting reflection cycle");

            let end = self.run_cycle(request, &mut session, &deadline, trace.as_ref())?;
            let result = match end {
                CycleEnd::Passed => {
                    self.log.append_log("data satisfies the request, returning result");
                    let attempt = session.cycle.last_attempt().ok_or_else(|| {
                        FetchError::Internal("passed cycle holds no attempt".to_string())
                    })?;
                    finish(&session, FetchStatus::Validated, StopReason::Passed, Some(attempt))
                }
                CycleEnd::IterationsExhausted => {
                    let attempt = select_fallback(session.cycle.attempts()).ok_or_else(|| {
                        FetchError::Internal("exhausted cycle holds no attempts".to_string())
                    })?;
                    self.log_fallback(attempt);
                    finish(
                        &session,
                        FetchStatus::Fallback,
                        StopReason::IterationsExhausted,
                        Some(attempt),
                    )
                }
                CycleEnd::Duplicate => match deadline.remaining() {
                    Ok(_) if !final_cycle => {
                        session.retry_count += 1;
                        self.log.append_log(&format!(
                            "restarting the fetch (retry {}/{})",
                            session.retry_count, request.max_retries
                        ));
                        continue;
                    }
                    Ok(_) => {
                        self.log.append_log("final cycle produced no result");
                        finish(&session, FetchStatus::NoResult, StopReason::DuplicateOutcome, None)
                    }
                    Err(exhausted) => {
                        self.log
                            .append_log(&format!("{exhausted}, no retry will be started"));
                        finish(&session, FetchStatus::NoResult, stop_reason(exhausted), None)
                    }
                },
                CycleEnd::OutOfBudget(exhausted) => {
                    self.log.append_log(&format!("{exhausted}, stopping"));
                    match select_fallback(session.cycle.attempts()) {
                        Some(attempt) => {
                            self.log_fallback(attempt);
                            finish(
                                &session,
                                FetchStatus::Fallback,
                                stop_reason(exhausted),
                                Some(attempt),
                            )
                        }
                        None => finish(&session, FetchStatus::NoResult, stop_reason(exhausted), None),
                    }
                }
            };

            session.terminal = Some(result);
        }

        let Some(result) = session.terminal else {
            return Err(FetchError::Internal(
                "session ended without a result".to_string(),
            ));
        };
        info!(
            status = ?result.status,
            stop = ?result.stop,
            cycles = result.cycles,
            attempts = result.attempts,
            "session finished"
        );
        if let Some(trace) = &trace
            && let Err(err) = trace.write_result(&result)
        {
            warn!(err = %err, "failed to write session result trace");
        }
        Ok(result)
    }

    /// One reflection cycle over a freshly reset `session.cycle`.
    fn run_cycle(
        &self,
        request: &FetchRequest,
        session: &mut SessionState,
        deadline: &Deadline,
        trace: Option<&SessionTrace>,
    ) -> Result<CycleEnd, FetchError> {
        let cycle_no = session.cycles_started;
        let current_time = self.clock.now_string();

        while session.cycle.iteration() < request.max_iterations {
            let index = session.cycle.next_index();
            let generation = match self.coder.generate(
                self.model,
                request,
                &current_time,
                &session.cycle,
                deadline,
            ) {
                Ok(generation) => generation,
                Err(err) => return self.agent_failure(err),
            };
            self.log.append_log(&format!(
                "attempt {index}: generated code:\n{}\n--------------------------------",
                generation.code
            ));
            if let Some(trace) = trace
                && let Err(err) = trace.write_generation(
                    cycle_no,
                    index,
                    &generation.prompt,
                    &generation.response,
                    &generation.code,
                )
            {
                warn!(err = %err, "failed to write generation trace");
            }

            if let Err(exhausted) = deadline.remaining() {
                return Ok(CycleEnd::OutOfBudget(exhausted));
            }
            let outcome = self.sandbox.execute(&generation.code, deadline);
            self.log_outcome(index, &outcome);
            if let Some(trace) = trace
                && let Err(err) = trace.write_outcome(cycle_no, index, &outcome)
            {
                warn!(err = %err, "failed to write outcome trace");
            }

            let outcome_digest = digest(&outcome);
            if let Some(earlier) = find_duplicate(session.cycle.attempts(), &outcome_digest) {
                debug!(index, earlier = earlier.index, digest = %outcome_digest, "duplicate outcome");
                self.log.append_log(&format!(
                    "attempt {index} repeated the result of attempt {}, abandoning this cycle",
                    earlier.index
                ));
                return Ok(CycleEnd::Duplicate);
            }

            session.cycle.push(
                Attempt {
                    index,
                    code: generation.code,
                    outcome,
                    digest: outcome_digest,
                },
                request.max_iterations,
            )?;
            session.total_attempts += 1;

            let attempt = session.cycle.last_attempt().ok_or_else(|| {
                FetchError::Internal("attempt vanished after push".to_string())
            })?;
            let critique = match self.critic.critique(
                self.model,
                &request.doc_snippet,
                &attempt.outcome,
                &attempt.code,
                deadline,
            ) {
                Ok(critique) => critique,
                Err(err) => return self.agent_failure(err),
            };
            if let Some(trace) = trace
                && let Err(err) = trace.write_critique(
                    cycle_no,
                    index,
                    &critique.prompt,
                    &critique.verdict,
                    &critique.reply,
                )
            {
                warn!(err = %err, "failed to write critique trace");
            }

            if critique.verdict.is_pass {
                return Ok(CycleEnd::Passed);
            }
            self.log.append_log(&format!(
                "attempt {index} rejected:\n{}\n--------------------------------",
                critique.verdict.combined_notes()
            ));
            session.cycle.record_verdict(critique.verdict);
        }

        Ok(CycleEnd::IterationsExhausted)
    }

    fn agent_failure(&self, err: AgentError) -> Result<CycleEnd, FetchError> {
        match err {
            AgentError::Budget(exhausted) => Ok(CycleEnd::OutOfBudget(exhausted)),
            AgentError::Model(err) => {
                self.log.append_log(&format!("model call failed: {err}"));
                Err(FetchError::Model(err))
            }
            AgentError::Prompt(message) => Err(FetchError::Internal(message)),
        }
    }

    fn open_trace(&self, request: &FetchRequest) -> Option<SessionTrace> {
        let dir = self.trace_dir.as_ref()?;
        match SessionTrace::create(dir, request) {
            Ok(trace) => {
                debug!(dir = %trace.dir().display(), "session trace enabled");
                Some(trace)
            }
            Err(err) => {
                warn!(err = %err, "failed to create session trace, continuing without it");
                None
            }
        }
    }

    fn log_outcome(&self, index: u32, outcome: &Outcome) {
        match outcome {
            Outcome::Failure { message, trace } => self.log.append_log(&format!(
                "attempt {index}: execution failed: {message}\n{trace}\n--------------------------------"
            )),
            Outcome::Value { .. } => self.log.append_log(&format!(
                "attempt {index}: execution returned {}",
                preview(outcome, LOG_PREVIEW_CHARS.min(self.preview_chars))
            )),
        }
    }

    fn log_fallback(&self, attempt: &Attempt) {
        self.log.append_log(&format!(
            "no attempt passed review, falling back to attempt {} (not validated)",
            attempt.index
        ));
    }
}

fn stop_reason(exhausted: BudgetExhausted) -> StopReason {
    match exhausted {
        BudgetExhausted::TimedOut => StopReason::TimedOut,
        BudgetExhausted::Cancelled => StopReason::Cancelled,
    }
}

fn finish(
    session: &SessionState,
    status: FetchStatus,
    stop: StopReason,
    attempt: Option<&Attempt>,
) -> FetchResult {
    FetchResult {
        status,
        stop,
        outcome: attempt.map(|a| a.outcome.clone()),
        code: attempt.map(|a| a.code.clone()),
        cycles: session.cycles_started,
        attempts: session.total_attempts,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::{
        FixedClock, RecordingLogSink, ScriptedModel, ScriptedSandbox, code_response,
        verdict_response,
    };

    fn config() -> FetchConfig {
        FetchConfig::default()
    }

    fn fail(notes: &str) -> Result<String, crate::error::ModelError> {
        Ok(verdict_response(false, notes, "try again"))
    }

    #[test]
    fn stop_reason_maps_budget() {
        assert_eq!(stop_reason(BudgetExhausted::TimedOut), StopReason::TimedOut);
        assert_eq!(stop_reason(BudgetExhausted::Cancelled), StopReason::Cancelled);
    }

    /// Verifies the digest check runs before the critic on a repeated outcome.
    #[test]
    fn duplicate_skips_critic_and_restarts() {
        let model = ScriptedModel::new([
            Ok(code_response("result = 1")),
            fail("wrong"),
            Ok(code_response("result = 1  # again")),
            // next cycle
            Ok(code_response("result = 2")),
            Ok(verdict_response(true, "ok", "")),
        ]);
        let sandbox = ScriptedSandbox::new([
            Outcome::value(json!(1)),
            Outcome::value(json!(1)),
            Outcome::value(json!(2)),
        ]);
        let log = RecordingLogSink::new();
        let clock = FixedClock::new("2024-03-01 09:30:00");
        let cfg = config();
        let controller = ReflectiveFetchController::new(&model, &sandbox, &log, &clock, &cfg);

        let result = controller
            .run(&FetchRequest::new("q", "rq", "docs", 3, 1))
            .expect("run");
        assert_eq!(result.status, FetchStatus::Validated);
        assert_eq!(result.outcome, Some(Outcome::value(json!(2))));
        assert_eq!(result.cycles, 2);
        assert_eq!(result.attempts, 2);
        assert_eq!(model.remaining(), 0);
        assert!(log.contains("repeated the result of attempt 0"));
        assert!(log.contains("restarting the fetch (retry 1/1)"));
    }

    #[test]
    fn trace_dir_receives_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let model = ScriptedModel::new([
            Ok(code_response("result = [1]")),
            Ok(verdict_response(true, "fine", "")),
        ]);
        let sandbox = ScriptedSandbox::new([Outcome::value(json!([1]))]);
        let log = RecordingLogSink::new();
        let clock = FixedClock::new("2024-03-01 09:30:00");
        let cfg = config();
        let controller = ReflectiveFetchController::new(&model, &sandbox, &log, &clock, &cfg)
            .with_trace_dir(Some(temp.path().to_path_buf()));

        controller
            .run(&FetchRequest::new("q", "rq", "docs", 1, 0))
            .expect("run");

        let sessions: Vec<_> = std::fs::read_dir(temp.path())
            .expect("read dir")
            .collect::<Result<_, _>>()
            .expect("entries");
        assert_eq!(sessions.len(), 1);
        let session_dir = sessions[0].path();
        assert!(session_dir.join("result.json").is_file());
        let attempt_dir = session_dir.join("cycle-1").join("attempt-0");
        assert!(attempt_dir.join("code.py").is_file());
        assert!(attempt_dir.join("outcome.json").is_file());
        assert!(attempt_dir.join("verdict.json").is_file());
    }
}
