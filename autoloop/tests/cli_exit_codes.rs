//! CLI tests for the `autoloop` binary.
//!
//! Spawns the binary and verifies exit codes and the JSON printed on stdout
//! for the loop lifecycle, the boundary hook and the handoff commands.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use autoloop::exit_codes;
use autoloop::io::config::{AgentConfig, AutoloopConfig, write_config};
use autoloop::io::init::{LoopPaths, init_workspace};
use serde_json::{Value, json};

fn autoloop(root: &Path, args: &[&str], stdin: Option<&str>) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_autoloop"))
        .current_dir(root)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn autoloop");
    {
        let mut pipe = child.stdin.take().expect("stdin");
        if let Some(input) = stdin {
            pipe.write_all(input.as_bytes()).expect("write stdin");
        }
    }
    child.wait_with_output().expect("autoloop output")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout json")
}

#[test]
fn start_without_memory_store_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = autoloop(temp.path(), &["start", "do things"], None);

    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("memory store unavailable"), "{stderr}");
    assert!(!LoopPaths::new(temp.path()).loop_state_path.exists());
}

#[test]
fn start_status_cancel_round() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    assert_eq!(
        autoloop(root, &["memory", "init"], None).status.code(),
        Some(exit_codes::OK)
    );

    let started = autoloop(root, &["start", "do things", "--max-iterations", "3"], None);
    assert_eq!(started.status.code(), Some(exit_codes::OK));
    let session = stdout_json(&started)["session_id"]
        .as_str()
        .expect("session id")
        .to_string();

    let again = autoloop(root, &["start", "other things"], None);
    assert_eq!(again.status.code(), Some(exit_codes::ERROR));

    let status = stdout_json(&autoloop(root, &["status"], None));
    assert_eq!(status["session_id"], session.as_str());
    assert_eq!(status["max_iterations"], 3);
    assert_eq!(status["checkpoint_pending"], false);

    let cancelled = autoloop(root, &["cancel"], None);
    assert_eq!(cancelled.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&cancelled)["session_id"], session.as_str());
    assert_eq!(
        stdout_json(&autoloop(root, &["status"], None)),
        json!({"active": false})
    );
    assert_eq!(
        autoloop(root, &["cancel"], None).status.code(),
        Some(exit_codes::ERROR)
    );
}

#[test]
fn boundary_hook_without_loop_skips() {
    let temp = tempfile::tempdir().expect("tempdir");
    let payload = json!({"transcript_path": temp.path().join("t.jsonl")}).to_string();
    let output = autoloop(temp.path(), &["boundary"], Some(&payload));

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(
        stdout_json(&output),
        json!({"action": "skip", "reason": "no active loop"})
    );
}

#[test]
fn handoff_save_then_load() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();

    let missing_store = autoloop(root, &["handoff", "load", "--session-id", "s-1"], None);
    assert_eq!(stdout_json(&missing_store)["found"], false);
    assert!(stdout_json(&missing_store)["error"].is_string());

    autoloop(root, &["memory", "init"], None);
    let handoff = json!({
        "session_id": "s-1",
        "cycle_number": 1,
        "original_objective": "Ship the release",
        "context_pct": 64.0,
        "accomplishments": ["tagged v1"],
        "next_actions": ["publish notes"],
    });
    let saved = autoloop(root, &["handoff", "save"], Some(&handoff.to_string()));
    assert_eq!(saved.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&saved)["saved"], true);

    let loaded = stdout_json(&autoloop(
        root,
        &["handoff", "load", "--session-id", "s-1"],
        None,
    ));
    assert_eq!(loaded["found"], true);
    let context = loaded["formatted_context"].as_str().expect("context");
    assert!(context.starts_with("## CONTINUATION (cycle 2, session s-1)"));
    assert!(context.contains("publish notes"));

    let other = stdout_json(&autoloop(
        root,
        &["handoff", "load", "--session-id", "s-2"],
        None,
    ));
    assert_eq!(other, json!({"found": false}));
}

#[test]
fn nudge_requires_active_loop() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = autoloop(temp.path(), &["nudge", "check the logs"], None);
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
}

#[test]
fn run_without_loop_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = autoloop(temp.path(), &["run"], None);
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
}

/// Agent script that prints `first.jsonl` on its first call and
/// `second.jsonl` afterwards, ignoring the prompt on stdin.
#[cfg(unix)]
fn configure_agent(root: &Path, first: &[Value], second: &[Value]) {
    let render = |lines: &[Value]| {
        lines
            .iter()
            .map(|l| format!("{l}\n"))
            .collect::<String>()
    };
    std::fs::write(root.join("first.jsonl"), render(first)).expect("first");
    std::fs::write(root.join("second.jsonl"), render(second)).expect("second");
    let dir = root.display();
    std::fs::write(
        root.join("agent.sh"),
        format!(
            "cat > /dev/null\n\
             if [ -f '{dir}/called' ]; then cat '{dir}/second.jsonl'; \
             else touch '{dir}/called'; cat '{dir}/first.jsonl'; fi\n"
        ),
    )
    .expect("agent script");

    let paths = init_workspace(root).expect("init");
    let cfg = AutoloopConfig {
        agent: AgentConfig {
            command: vec!["sh".to_string(), root.join("agent.sh").display().to_string()],
            resume_flag: None,
        },
        ..AutoloopConfig::default()
    };
    write_config(&paths.config_path, &cfg).expect("config");
}

#[cfg(unix)]
fn text(text: &str) -> Value {
    json!({
        "type": "assistant",
        "message": {"role": "assistant", "content": [{"type": "text", "text": text}]},
    })
}

#[cfg(unix)]
fn usage(input_tokens: u64) -> Value {
    json!({
        "type": "result",
        "session_id": "agent-session-1",
        "usage": {"input_tokens": input_tokens, "output_tokens": 0},
    })
}

#[cfg(unix)]
#[test]
fn run_exits_with_threshold_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    configure_agent(
        root,
        &[text("did a lot of work"), usage(150_000)],
        &[text("unused")],
    );
    autoloop(root, &["memory", "init"], None);
    assert_eq!(
        autoloop(root, &["start", "big task"], None).status.code(),
        Some(exit_codes::OK)
    );

    let output = autoloop(root, &["run"], None);
    assert_eq!(output.status.code(), Some(exit_codes::CONTEXT_THRESHOLD));
    let result = stdout_json(&output);
    assert_eq!(result["result"]["stop"], "context_threshold");
    assert_eq!(result["final_iteration"], 1);
    assert!(LoopPaths::new(root).loop_state_path.exists());
}

#[cfg(unix)]
#[test]
fn supervise_hands_off_and_completes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    configure_agent(
        root,
        &[text("NEXT: finish the docs"), usage(150_000)],
        &[text("Docs finished. <promise>DONE</promise>")],
    );
    autoloop(root, &["memory", "init"], None);
    autoloop(
        root,
        &["start", "write docs", "--completion-promise", "DONE"],
        None,
    );

    let output = autoloop(root, &["supervise"], None);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let result = stdout_json(&output);
    assert_eq!(result["state"], json!({"state": "completed"}));
    assert_eq!(result["cycles_run"], 2);
    assert_eq!(result["handoffs"].as_array().map(Vec::len), Some(1));

    let paths = LoopPaths::new(root);
    assert!(!paths.loop_state_path.exists());
    let summary = std::fs::read_to_string(&paths.summary_path).expect("summary");
    assert!(summary.contains("- Outcome: completed"));
}
