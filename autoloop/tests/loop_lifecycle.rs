//! Loop-level tests for full autoloop lifecycle scenarios.
//!
//! These tests drive cycles and the supervisor in-process with scripted
//! agents and an in-memory store to verify end-to-end behavior: iteration
//! caps, completion promises, context handoffs between cycles, cancellation
//! and lock contention.

use std::fs;
use std::path::Path;
use std::time::Duration;

use autoloop::boundary::{BoundaryConfig, BoundaryDecision, process_boundary};
use autoloop::core::cycle::{CycleExit, CycleState};
use autoloop::core::state::LoopOptions;
use autoloop::core::types::{Outcome, StrategyName};
use autoloop::exit_codes;
use autoloop::io::init::LoopPaths;
use autoloop::io::loop_state::StateLock;
use autoloop::io::memory::{MemoryClient, MemoryStore, tags};
use autoloop::looping::{CycleConfig, CycleStop, run_cycle};
use autoloop::start::cancel_loop;
use autoloop::supervisor::{CycleRequest, CycleRunner, SupervisorConfig, supervise};
use autoloop::test_support::{
    InMemoryStore, ScriptedAgent, TestWorkspace, assistant_line, result_line, tool_use_line,
};

fn no_sleep(_: Duration) {}

fn summary(root: &Path) -> String {
    fs::read_to_string(LoopPaths::new(root).summary_path).expect("read summary")
}

/// Runs each cycle in-process against one scripted agent, the way
/// `autoloop run` would in a child process.
struct InProcessRunner<'a> {
    agent: &'a ScriptedAgent,
    store: &'a InMemoryStore,
}

impl CycleRunner for InProcessRunner<'_> {
    fn run_cycle(&self, request: &CycleRequest) -> CycleExit {
        match run_cycle(
            &request.root,
            self.agent,
            self.store,
            &CycleConfig::default(),
            &mut no_sleep,
            |_| {},
        ) {
            Ok(outcome) => CycleExit::from_exit_code(Some(outcome.exit_code()), "cycle ended"),
            Err(err) => CycleExit::Failed {
                code: Some(exit_codes::ERROR),
                detail: format!("{err:#}"),
                retryable: true,
            },
        }
    }
}

/// Cycle 1 crosses the context threshold and hands off; cycle 2 starts fresh
/// from the handoff and fulfils the completion promise.
#[test]
fn supervised_session_hands_off_then_completes() {
    let ws = TestWorkspace::new();
    let store = InMemoryStore::new();
    let session = ws.start_loop(
        &store,
        "Port the parser",
        &LoopOptions {
            completion_promise: Some("PARSER PORTED".to_string()),
            ..LoopOptions::default()
        },
    );
    let agent = ScriptedAgent::new(vec![
        vec![
            tool_use_line("Edit", Some("src/parser.rs"), None),
            assistant_line("Ported the lexer.\nNEXT: port the expression grammar"),
            result_line(130_000),
        ],
        vec![assistant_line("Grammar done. <promise>PARSER PORTED</promise>")],
    ]);
    let runner = InProcessRunner {
        agent: &agent,
        store: &store,
    };

    let outcome = supervise(
        ws.root(),
        &runner,
        &store,
        &SupervisorConfig::from_config(&Default::default()),
        &mut no_sleep,
    )
    .expect("supervise");

    agent.assert_drained();
    assert_eq!(outcome.session_id, session);
    assert_eq!(outcome.state, CycleState::Completed);
    assert_eq!(outcome.cycles_run, 2);
    assert_eq!(outcome.handoffs.len(), 1);
    assert_eq!(outcome.exit_code(), exit_codes::OK);

    let prompts = agent.prompts();
    assert_eq!(prompts[0], "Port the parser");
    assert!(prompts[1].starts_with("## CONTINUATION (cycle 2"));
    assert!(prompts[1].contains("port the expression grammar"));
    assert!(prompts[1].ends_with("## OBJECTIVE\nPort the parser\n"));
    // A new cycle never resumes the previous agent session.
    assert_eq!(agent.resumes(), vec![None, None]);

    assert!(ws.state().is_none());
    let summary = summary(ws.root());
    assert!(summary.contains("- Outcome: completed"));
    assert!(summary.contains("- Iterations: 2"));
}

#[test]
fn iteration_cap_with_progress_is_partial() {
    let ws = TestWorkspace::new();
    let store = InMemoryStore::new();
    let session = ws.start_loop(
        &store,
        "Add caching",
        &LoopOptions {
            max_iterations: 2,
            ..LoopOptions::default()
        },
    );
    let agent = ScriptedAgent::new(vec![
        vec![
            tool_use_line("Write", Some("src/cache.rs"), None),
            assistant_line("LEARNING: the store is keyed by path"),
        ],
        vec![assistant_line("ok")],
    ]);

    let outcome = run_cycle(
        ws.root(),
        &agent,
        &store,
        &CycleConfig::default(),
        &mut no_sleep,
        |_| {},
    )
    .expect("cycle");

    assert_eq!(outcome.final_iteration, 2);
    assert_eq!(
        outcome.stop,
        CycleStop::Terminated {
            outcome: Outcome::Partial,
            reason: "max iterations reached (2)".to_string(),
        }
    );
    assert!(ws.state().is_none());
    assert!(summary(ws.root()).contains("- Outcome: partial"));

    let memory = MemoryClient::new(&store);
    assert_eq!(
        memory.session_learnings(&session),
        vec!["the store is keyed by path".to_string()]
    );
    assert_eq!(memory.session_contents(&session, tags::STATUS).len(), 2);
}

#[test]
fn idle_iterations_switch_to_recovery() {
    let ws = TestWorkspace::new();
    let store = InMemoryStore::new();
    ws.start_loop(
        &store,
        "Fix the build",
        &LoopOptions {
            max_iterations: 6,
            ..LoopOptions::default()
        },
    );
    let agent = ScriptedAgent::new((0..6).map(|_| vec![assistant_line("ok")]).collect());

    let mut strategies = Vec::new();
    let outcome = run_cycle(
        ws.root(),
        &agent,
        &store,
        &CycleConfig::default(),
        &mut no_sleep,
        |decision| {
            if let BoundaryDecision::Continue { strategy, .. } = decision {
                strategies.push(*strategy);
            }
        },
    )
    .expect("cycle");

    assert_eq!(strategies.len(), 5);
    assert_eq!(strategies[0], StrategyName::Explore);
    assert_eq!(strategies[4], StrategyName::Recovery);
    assert!(agent.prompts()[5].contains("Stop repeating the approach that keeps failing."));
    assert!(matches!(
        outcome.stop,
        CycleStop::Terminated {
            outcome: Outcome::Incomplete,
            ..
        }
    ));
}

#[test]
fn cancelled_loop_schedules_nothing() {
    let ws = TestWorkspace::new();
    let store = InMemoryStore::new();
    let session = ws.start_loop(&store, "Write docs", &LoopOptions::default());

    let cancelled = cancel_loop(ws.root()).expect("cancel");
    assert_eq!(cancelled.session_id.as_deref(), Some(session.as_str()));
    assert!(summary(ws.root()).contains("- Outcome: cancelled"));

    let transcript = ws.write_transcript(&[assistant_line("finished a section")]);
    let decision = process_boundary(
        ws.root(),
        &transcript,
        &store,
        &BoundaryConfig::default(),
        &mut no_sleep,
    )
    .expect("boundary");
    assert_eq!(decision, BoundaryDecision::Inactive);
    assert_eq!(decision.to_json()["action"], "skip");
}

#[test]
fn held_lock_skips_boundary_without_changes() {
    let ws = TestWorkspace::new();
    let store = InMemoryStore::new();
    ws.start_loop(&store, "Refactor", &LoopOptions::default());
    let before = store.entries().len();
    let paths = LoopPaths::new(ws.root());
    let _held = StateLock::acquire(&paths.lock_path, Duration::from_secs(1)).expect("lock");

    let transcript = ws.write_transcript(&[assistant_line("progress")]);
    let decision = process_boundary(
        ws.root(),
        &transcript,
        &store,
        &BoundaryConfig {
            lock_timeout: Duration::from_millis(50),
            ..BoundaryConfig::default()
        },
        &mut no_sleep,
    )
    .expect("boundary");

    assert!(matches!(decision, BoundaryDecision::Skipped { .. }));
    assert_eq!(ws.state().expect("state").iteration, 0);
    assert_eq!(store.entries().len(), before);
    assert!(store.is_available());
}
