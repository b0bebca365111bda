//! Session-level tests for the reflective fetch controller.
//!
//! These drive `ReflectiveFetchController::run` with scripted collaborators to
//! verify cycle termination, duplicate handling, retries, fallback selection,
//! budget handling, and error surfacing.

use std::time::Duration;

use fetcher::core::budget::{CancelToken, Deadline};
use fetcher::io::config::FetchConfig;
use fetcher::io::log_sink::{LogSink, NullLogSink};
use fetcher::io::retry::{RetryPolicy, RetryingModel};
use fetcher::io::sandbox::Sandbox;
use fetcher::test_support::{
    FixedClock, RecordingLogSink, ScriptedModel, ScriptedSandbox, code_response,
    verdict_response,
};
use fetcher::{
    FetchError, FetchRequest, FetchResult, FetchStatus, ModelError, Outcome,
    ReflectiveFetchController, StopReason,
};
use serde_json::json;

const NOW: &str = "2024-03-01 09:30:00";
const DOCS: &str = "daily(symbol, start, end) -> list of {date, close}";

type Reply = Result<String, ModelError>;

fn code(src: &str) -> Reply {
    Ok(code_response(src))
}

fn pass() -> Reply {
    Ok(verdict_response(true, "matches the request", ""))
}

fn fail(thoughts: &str) -> Reply {
    Ok(verdict_response(false, thoughts, "adjust the query"))
}

fn request(max_iterations: u32, max_retries: u32) -> FetchRequest {
    FetchRequest::new(
        "How did AAPL close last week?",
        "AAPL daily close 2024-02-19..2024-02-23",
        DOCS,
        max_iterations,
        max_retries,
    )
}

/// Run one session against the scripted doubles with default config.
fn run_session(
    model: &ScriptedModel,
    sandbox: &ScriptedSandbox,
    log: &dyn LogSink,
    request: &FetchRequest,
) -> Result<FetchResult, FetchError> {
    let clock = FixedClock::new(NOW);
    let cfg = FetchConfig::default();
    ReflectiveFetchController::new(model, sandbox, log, &clock, &cfg).run(request)
}

fn is_initial_prompt(content: &str) -> bool {
    !content.contains("### Previous Code")
}

/// A passing verdict at iteration i ends the session: no attempt i+1.
#[test]
fn passing_verdict_stops_the_cycle() {
    let model = ScriptedModel::new([
        code("result = daily('AAPL')"),
        fail("only one row"),
        code("result = daily('AAPL', '2024-02-19', '2024-02-23')"),
        pass(),
        code("never requested"),
    ]);
    let sandbox = ScriptedSandbox::new([
        Outcome::value(json!([{"close": 182.3}])),
        Outcome::value(json!([1, 2, 3, 4, 5])),
        Outcome::value(json!("never executed")),
    ]);
    let log = RecordingLogSink::new();

    let result = run_session(&model, &sandbox, &log, &request(3, 3)).expect("run");

    assert_eq!(result.status, FetchStatus::Validated);
    assert_eq!(result.stop, StopReason::Passed);
    assert_eq!(result.outcome, Some(Outcome::value(json!([1, 2, 3, 4, 5]))));
    assert_eq!(
        result.code.as_deref(),
        Some("result = daily('AAPL', '2024-02-19', '2024-02-23')")
    );
    assert_eq!(result.cycles, 1);
    assert_eq!(result.attempts, 2);
    assert_eq!(sandbox.executed().len(), 2);
    assert_eq!(model.remaining(), 1);
    assert!(log.contains("data satisfies the request"));
}

/// Scenario A: a duplicate at iteration 2 aborts the cycle before the critic
/// runs, and the next cycle starts from an empty history.
#[test]
fn duplicate_aborts_cycle_and_next_cycle_starts_empty() {
    let model = ScriptedModel::new([
        code("result = daily('AAPL')"),
        fail("empty frame"),
        code("result = daily('AAPL')  # retry"),
        // second cycle
        code("result = daily('AAPL', '2024-02-19', '2024-02-23')"),
        pass(),
    ]);
    let sandbox = ScriptedSandbox::new([
        Outcome::empty(),
        Outcome::empty(),
        Outcome::value(json!([1, 2, 3])),
    ]);
    let log = RecordingLogSink::new();

    let result = run_session(&model, &sandbox, &log, &request(3, 2)).expect("run");

    assert_eq!(result.status, FetchStatus::Validated);
    assert_eq!(result.cycles, 2);
    assert_eq!(result.attempts, 2, "the duplicate is never recorded");

    let calls = model.calls();
    assert_eq!(calls.len(), 5, "no critique for the duplicate attempt");
    assert!(is_initial_prompt(&calls[0][0].content));
    assert!(!is_initial_prompt(&calls[2][0].content));
    assert!(
        is_initial_prompt(&calls[3][0].content),
        "a new cycle starts from the initial prompt"
    );
    assert!(!calls[3][0].content.contains("empty frame"));
    assert!(log.contains("repeated the result of attempt 0"));
}

/// Digests compare only within a cycle: a later cycle may reproduce an earlier outcome.
#[test]
fn earlier_cycle_outcomes_are_not_duplicates() {
    let model = ScriptedModel::new([
        code("a"),
        fail("wrong"),
        code("b"),
        // second cycle reproduces the first outcome
        code("c"),
        fail("still wrong"),
        code("d"),
        pass(),
    ]);
    let sandbox = ScriptedSandbox::new([
        Outcome::value(json!(1)),
        Outcome::value(json!(1)),
        Outcome::value(json!(1)),
        Outcome::value(json!(2)),
    ]);
    let log = RecordingLogSink::new();

    let result = run_session(&model, &sandbox, &log, &request(3, 1)).expect("run");

    assert_eq!(result.status, FetchStatus::Validated);
    assert_eq!(result.outcome, Some(Outcome::value(json!(2))));
    assert_eq!(result.cycles, 2);
    assert_eq!(result.attempts, 3);
}

#[test]
fn zero_retries_runs_exactly_one_cycle() {
    let model = ScriptedModel::new([code("a"), fail("no"), code("b")]);
    let sandbox = ScriptedSandbox::new([Outcome::value(json!(7)), Outcome::value(json!(7))]);
    let log = RecordingLogSink::new();

    let result = run_session(&model, &sandbox, &log, &request(3, 0)).expect("run");

    assert_eq!(result.status, FetchStatus::NoResult);
    assert_eq!(result.stop, StopReason::DuplicateOutcome);
    assert_eq!(result.outcome, None);
    assert_eq!(result.code, None);
    assert_eq!(result.cycles, 1);
    assert_eq!(model.remaining(), 0);
}

/// After the bounded retries, one more cycle runs and its result is returned as-is.
#[test]
fn final_cycle_runs_after_retries_and_may_return_nothing() {
    let mut replies = Vec::new();
    let mut outcomes = Vec::new();
    for cycle in 0..3 {
        replies.extend([code("a"), fail("no"), code("b")]);
        outcomes.extend([Outcome::value(json!(cycle)), Outcome::value(json!(cycle))]);
    }
    let model = ScriptedModel::new(replies);
    let sandbox = ScriptedSandbox::new(outcomes);
    let log = RecordingLogSink::new();

    let result = run_session(&model, &sandbox, &log, &request(3, 2)).expect("run");

    assert_eq!(result.status, FetchStatus::NoResult);
    assert_eq!(result.cycles, 3, "max_retries + 1 cycles");
    assert!(log.contains("restarting the fetch (retry 1/2)"));
    assert!(log.contains("restarting the fetch (retry 2/2)"));
    assert!(log.contains("running the final cycle unconditionally"));
    assert!(log.contains("final cycle produced no result"));
}

/// Exhausting the iteration budget falls back to the longest outcome, earliest on ties.
#[test]
fn exhausted_cycle_falls_back_to_longest_outcome() {
    let model = ScriptedModel::new([
        code("short"),
        fail("too little"),
        code("long"),
        fail("wrong field"),
        code("also long"),
        fail("wrong field again"),
    ]);
    let sandbox = ScriptedSandbox::new([
        Outcome::value(json!("abc")),
        Outcome::value(json!("abcdefgh")),
        Outcome::value(json!("zyxwvuts")),
    ]);
    let log = RecordingLogSink::new();

    let result = run_session(&model, &sandbox, &log, &request(3, 3)).expect("run");

    assert_eq!(result.status, FetchStatus::Fallback);
    assert_eq!(result.stop, StopReason::IterationsExhausted);
    assert!(!result.is_validated());
    assert_eq!(result.outcome, Some(Outcome::value(json!("abcdefgh"))));
    assert_eq!(result.code.as_deref(), Some("long"));
    assert_eq!(result.attempts, 3, "a cycle never exceeds max_iterations");
    assert_eq!(result.cycles, 1, "a fallback is returned without retrying");
    assert!(log.contains("falling back to attempt 1"));
}

/// Scenario B: a transient completion failure is retried and the cycle completes.
#[test]
fn transient_model_failure_is_retried() {
    let scripted = ScriptedModel::new([
        Err(ModelError::Transient("connection reset".to_string())),
        code("result = daily('AAPL')"),
        Err(ModelError::RateLimited { retry_after: None }),
        pass(),
    ]);
    let model = RetryingModel::new(
        scripted,
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        },
    )
    .with_sleeper(|_| {});
    let sandbox = ScriptedSandbox::new([Outcome::value(json!([1, 2]))]);
    let log = RecordingLogSink::new();
    let clock = FixedClock::new(NOW);
    let cfg = FetchConfig::default();

    let result = ReflectiveFetchController::new(&model, &sandbox, &log, &clock, &cfg)
        .run(&request(3, 0))
        .expect("run");

    assert_eq!(result.status, FetchStatus::Validated);
    assert_eq!(model.inner().calls().len(), 4);
}

/// Scenario C: a sandbox failure is an ordinary attempt that the critic sees.
#[test]
fn sandbox_failure_goes_to_critic_and_session_continues() {
    let model = ScriptedModel::new([
        code("result = df['Close']"),
        fail("the script raised KeyError"),
        code("result = df['close']"),
        pass(),
    ]);
    let sandbox = ScriptedSandbox::new([
        Outcome::failure("KeyError: 'Close'", "Traceback (most recent call last): ..."),
        Outcome::value(json!([182.3, 181.9])),
    ]);
    let log = RecordingLogSink::new();

    let result = run_session(&model, &sandbox, &log, &request(3, 0)).expect("run");

    assert_eq!(result.status, FetchStatus::Validated);
    let calls = model.calls();
    assert!(calls[1][0].content.contains("KeyError: 'Close'"), "critic sees the failure");
    assert!(calls[2][0].content.contains("the script raised KeyError"));
    assert!(log.contains("execution failed: KeyError: 'Close'"));
}

#[test]
fn unparseable_critique_is_a_failing_verdict() {
    let model = ScriptedModel::new([
        code("result = 1"),
        Ok("I think this is probably fine?".to_string()),
        code("result = [1]"),
        pass(),
    ]);
    let sandbox = ScriptedSandbox::new([Outcome::value(json!(1)), Outcome::value(json!([1]))]);
    let log = RecordingLogSink::new();

    let result = run_session(&model, &sandbox, &log, &request(3, 0)).expect("run");

    assert_eq!(result.status, FetchStatus::Validated);
    assert_eq!(result.attempts, 2);
    assert!(model.calls()[2][0].content.contains("parse_error"));
}

/// A passing critique with a raw line break in its notes still validates.
#[test]
fn multiline_passing_critique_validates() {
    let model = ScriptedModel::new([
        code("result = closes()"),
        Ok("```json\n{'result': {'is_pass': True, 'thoughts': 'rows look right\nall five days present',}}\n```"
            .to_string()),
    ]);
    let sandbox = ScriptedSandbox::new([Outcome::value(json!([1, 2, 3, 4, 5]))]);
    let log = RecordingLogSink::new();

    let result = run_session(&model, &sandbox, &log, &request(3, 0)).expect("run");

    assert_eq!(result.status, FetchStatus::Validated);
    assert_eq!(result.attempts, 1);
}

/// Same request, deterministic collaborators, fixed clock: identical results.
#[test]
fn sessions_are_idempotent() {
    let script = || {
        (
            ScriptedModel::new([
                code("a"),
                fail("no"),
                code("b"),
                fail("no"),
            ]),
            ScriptedSandbox::new([Outcome::value(json!([1])), Outcome::value(json!([1, 2]))]),
        )
    };
    let (model_a, sandbox_a) = script();
    let (model_b, sandbox_b) = script();

    let first = run_session(&model_a, &sandbox_a, &NullLogSink, &request(2, 0)).expect("first");
    let second =
        run_session(&model_b, &sandbox_b, &NullLogSink, &request(2, 0)).expect("second");

    assert_eq!(first, second);
    assert_eq!(model_a.calls(), model_b.calls());
}

/// Independent sessions on separate threads share the log sink and clock only.
#[test]
fn concurrent_sessions_do_not_interfere() {
    let log = RecordingLogSink::new();
    let clock = FixedClock::new(NOW);
    let cfg = FetchConfig::default();

    let results: Vec<FetchResult> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let log = &log;
                let clock = &clock;
                let cfg = &cfg;
                scope.spawn(move || {
                    let model = ScriptedModel::new([code(&format!("result = {n}")), pass()]);
                    let sandbox = ScriptedSandbox::new([Outcome::value(json!(n))]);
                    ReflectiveFetchController::new(&model, &sandbox, log, clock, cfg)
                        .run(&request(2, 1))
                        .expect("run")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("session thread"))
            .collect()
    });

    for (n, result) in results.iter().enumerate() {
        assert_eq!(result.status, FetchStatus::Validated);
        assert_eq!(result.outcome, Some(Outcome::value(json!(n))));
    }
    assert_eq!(
        log.messages()
            .iter()
            .filter(|m| m.starts_with("session started"))
            .count(),
        4
    );
}

#[test]
fn zero_iterations_is_rejected_before_any_model_call() {
    let model = ScriptedModel::new([code("a")]);
    let sandbox = ScriptedSandbox::new([]);
    let log = RecordingLogSink::new();

    let err = run_session(&model, &sandbox, &log, &request(0, 3)).unwrap_err();

    assert!(matches!(err, FetchError::InvalidRequest(_)), "{err:?}");
    assert!(model.calls().is_empty());
    assert!(log.messages().is_empty());
}

#[test]
fn empty_doc_snippet_is_accepted() {
    let model = ScriptedModel::new([code("result = 1"), pass()]);
    let sandbox = ScriptedSandbox::new([Outcome::value(json!(1))]);
    let log = RecordingLogSink::new();
    let request = FetchRequest::new("q", "rq", "", 1, 0);

    let result = run_session(&model, &sandbox, &log, &request).expect("run");

    assert_eq!(result.status, FetchStatus::Validated);
    assert!(!model.calls()[0][0].content.contains("### API Documentation"));
}

#[test]
fn terminal_model_error_surfaces() {
    let model = ScriptedModel::new([
        code("result = 1"),
        Err(ModelError::Fatal("api error 401 Unauthorized".to_string())),
    ]);
    let sandbox = ScriptedSandbox::new([Outcome::value(json!(1))]);
    let log = RecordingLogSink::new();

    let err = run_session(&model, &sandbox, &log, &request(3, 3)).unwrap_err();

    assert!(matches!(err, FetchError::Model(ModelError::Fatal(_))), "{err:?}");
    assert!(log.contains("model call failed"));
}

#[test]
fn exhausted_model_retries_surface() {
    let scripted = ScriptedModel::new([
        Err(ModelError::Transient("502".to_string())),
        Err(ModelError::Transient("502".to_string())),
    ]);
    let model = RetryingModel::new(
        scripted,
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        },
    )
    .with_sleeper(|_| {});
    let sandbox = ScriptedSandbox::new([]);
    let log = RecordingLogSink::new();
    let clock = FixedClock::new(NOW);
    let cfg = FetchConfig::default();

    let err = ReflectiveFetchController::new(&model, &sandbox, &log, &clock, &cfg)
        .run(&request(3, 3))
        .unwrap_err();

    assert!(
        matches!(err, FetchError::Model(ModelError::Exhausted { attempts: 2, .. })),
        "{err:?}"
    );
    assert!(sandbox.executed().is_empty());
}

#[test]
fn expired_session_budget_times_out_without_calls() {
    let model = ScriptedModel::new([code("a")]);
    let sandbox = ScriptedSandbox::new([]);
    let log = RecordingLogSink::new();
    let clock = FixedClock::new(NOW);
    let cfg = FetchConfig::default();

    let result = ReflectiveFetchController::new(&model, &sandbox, &log, &clock, &cfg)
        .with_session_timeout(Duration::ZERO)
        .run(&request(3, 3))
        .expect("run");

    assert_eq!(result.status, FetchStatus::NoResult);
    assert_eq!(result.stop, StopReason::TimedOut);
    assert_eq!(result.cycles, 1, "no further retries start");
    assert!(model.calls().is_empty());
}

/// An effectively unbounded session budget still clips calls to the request timeout.
#[test]
fn unbounded_session_budget_runs_normally() {
    let model = ScriptedModel::new([code("result = [1]"), pass()]);
    let sandbox = ScriptedSandbox::new([Outcome::value(json!([1]))]);
    let log = RecordingLogSink::new();
    let clock = FixedClock::new(NOW);
    let cfg = FetchConfig::default();

    let result = ReflectiveFetchController::new(&model, &sandbox, &log, &clock, &cfg)
        .with_session_timeout(Duration::MAX)
        .run(&request(3, 3))
        .expect("run");

    assert_eq!(result.status, FetchStatus::Validated);
    assert!(
        model
            .timeouts()
            .iter()
            .all(|t| *t == cfg.model.request_timeout())
    );
}

/// Cancels the session from inside the first execution.
struct CancellingSandbox {
    token: CancelToken,
}

impl Sandbox for CancellingSandbox {
    fn execute(&self, _code: &str, _deadline: &Deadline) -> Outcome {
        self.token.cancel();
        Outcome::value(json!({"rows": 3}))
    }
}

#[test]
fn cancellation_mid_cycle_falls_back_to_recorded_attempts() {
    let token = CancelToken::new();
    let model = ScriptedModel::new([code("result = rows()"), pass()]);
    let sandbox = CancellingSandbox {
        token: token.clone(),
    };
    let log = RecordingLogSink::new();
    let clock = FixedClock::new(NOW);
    let cfg = FetchConfig::default();

    let result = ReflectiveFetchController::new(&model, &sandbox, &log, &clock, &cfg)
        .with_cancel_token(token)
        .run(&request(3, 3))
        .expect("run");

    assert_eq!(result.status, FetchStatus::Fallback);
    assert_eq!(result.stop, StopReason::Cancelled);
    assert_eq!(result.outcome, Some(Outcome::value(json!({"rows": 3}))));
    assert_eq!(model.calls().len(), 1, "the critic is never asked");
    assert!(log.contains("session cancelled"));
}
