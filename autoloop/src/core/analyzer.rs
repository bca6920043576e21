//! Transcript analyzer: turns one iteration's transcript into structured signal.
//!
//! Pure and total. Every recogniser is a fixed regex table so that results are
//! reproducible for a given transcript.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::transcript::{Block, Role, Transcript};
use crate::core::types::{ErrorMatch, ErrorPattern, PhaseTag, RepeatedError, TranscriptAnalysis};

const SAMPLE_MAX_CHARS: usize = 200;
const MEANINGFUL_OUTPUT_CHARS: usize = 500;

static ERROR_TABLE: LazyLock<Vec<(ErrorPattern, Regex)>> = LazyLock::new(|| {
    let table = [
        (
            ErrorPattern::CompilationError,
            r"(?i)\bcompil(?:ation|e|er)\s+(?:error|failed)|\berror\[E\d{4}\]|\bcould not compile\b|\bbuild failed\b",
        ),
        (
            ErrorPattern::SyntaxError,
            r"(?i)\bsyntax\s?error\b|\bunexpected token\b|\bparse error\b",
        ),
        (
            ErrorPattern::TestFailure,
            r"(?i:\btests?\s+failed\b|\bassertion\s?(?:error|failed)\b|\b\d+\s+failing\b|\btest result: failed\b)|\bFAILED\b",
        ),
        (
            ErrorPattern::Timeout,
            r"(?i)\btimed\s?out\b|\btimeout\b|\bdeadline exceeded\b",
        ),
        (
            ErrorPattern::MissingFile,
            r"(?i)\bno such file or directory\b|\bfile not found\b|\bENOENT\b|\bcannot find (?:the )?file\b",
        ),
        (
            ErrorPattern::UnresolvedModule,
            r"(?i)\bcannot find module\b|\bmodule not found\b|\bunresolved import\b|\bno module named\b|\bcould not resolve\b",
        ),
        (
            ErrorPattern::TypeError,
            r"(?i)\btype\s?error\b|\bmismatched types\b|\bis not assignable to type\b",
        ),
        (
            ErrorPattern::PermissionDenied,
            r"(?i)\bpermission denied\b|\bEACCES\b|\boperation not permitted\b",
        ),
    ];
    table
        .into_iter()
        .map(|(pattern, re)| (pattern, Regex::new(re).expect("error pattern regex")))
        .collect()
});

static TEST_RUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bcargo (?:test|nextest)\b|\b(?:npm|yarn|pnpm)(?: run)? test\b|\bpytest\b|\bgo test\b|\bjest\b|\bvitest\b|\bmocha\b|\brspec\b|\brunning \d+ tests?\b|\btest result:",
    )
    .expect("test run regex")
});

static TEST_PASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\ball tests pass(?:ed|ing)?\b|\btests? passed\b|\b\d+ passed\b|\btest result: ok\b|\btests passing\b",
    )
    .expect("test pass regex")
});

static TEST_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i:\btests? failed\b|\b[1-9]\d* failed\b|\b[1-9]\d* failing\b|\btest result: failed\b)|\bFAILED\b",
    )
    .expect("test fail regex")
});

static PHASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bphase\s+(\d+)\s+(?:is\s+)?complete(?:d)?\b").expect("phase regex")
});

static TESTS_PASSING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\btests passing\b|\ball tests pass(?:ed|ing)?\b").expect("tests passing regex")
});

static IMPLEMENTATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bimplementation\s+(?:is\s+)?complete(?:d)?\b")
        .expect("implementation regex")
});

static SETUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bsetup\s+(?:is\s+)?(?:done|complete(?:d)?)\b").expect("setup regex")
});

static QUOTED_SPAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"`([^`\s]+)`|"([^"\s]+)"|'([^'\s]+)'"#).expect("span regex"));

static PATH_SHAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.~/\-]+$").expect("path shape regex"));

static EXTENSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^./]\.[A-Za-z][A-Za-z0-9]{0,7}$").expect("extension regex"));

static NOTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s*)?(LEARNING|NEXT):\s*(.+?)\s*$").expect("note regex")
});

const MODIFYING_TOOLS: [&str; 4] = ["Write", "Edit", "MultiEdit", "NotebookEdit"];

/// Analyze a parsed transcript.
pub fn analyze(transcript: &Transcript) -> TranscriptAnalysis {
    let mut analysis = TranscriptAnalysis::default();
    let mut counts: Vec<(ErrorPattern, u32)> = Vec::new();
    let mut saw_fence = false;

    for message in &transcript.messages {
        for block in &message.blocks {
            match block {
                Block::Text(text) if message.role == Role::Assistant => {
                    analysis.assistant_chars += text.chars().count();
                    saw_fence |= text.contains("```");
                    scan_assistant_text(text, &mut analysis, &mut counts);
                    scan_tests(text, &mut analysis);
                }
                // User and system text repeats the mission and injected context.
                Block::Text(_) => {}
                Block::ToolResult(text) => scan_tests(text, &mut analysis),
                Block::ToolUse {
                    name,
                    path,
                    command,
                } if message.role == Role::Assistant => {
                    if let Some(path) = path
                        && is_modifying_tool(name)
                        && !path.trim().is_empty()
                    {
                        analysis.files_modified.insert(path.trim().to_string());
                    }
                    if let Some(command) = command {
                        scan_tests(command, &mut analysis);
                    }
                }
                Block::ToolUse { .. } => {}
            }
        }
    }

    let mut repeated: Vec<RepeatedError> = counts
        .into_iter()
        .filter(|(_, count)| *count >= 2)
        .map(|(pattern, count)| RepeatedError { pattern, count })
        .collect();
    // Stable sort keeps discovery order on ties.
    repeated.sort_by(|a, b| b.count.cmp(&a.count));
    analysis.repeated_errors = repeated;

    analysis.meaningful_changes = !analysis.files_modified.is_empty()
        || analysis.tests_run
        || !analysis.phase_completions.is_empty()
        || analysis.assistant_chars > MEANINGFUL_OUTPUT_CHARS
        || saw_fence;
    analysis
}

fn scan_assistant_text(
    text: &str,
    analysis: &mut TranscriptAnalysis,
    counts: &mut Vec<(ErrorPattern, u32)>,
) {
    for line in text.lines() {
        for (pattern, re) in ERROR_TABLE.iter() {
            let hits = re.find_iter(line).count() as u32;
            if hits == 0 {
                continue;
            }
            let sample = truncate(line.trim(), SAMPLE_MAX_CHARS);
            analysis.errors.extend((0..hits).map(|_| ErrorMatch {
                pattern: *pattern,
                sample: sample.clone(),
            }));
            match counts.iter_mut().find(|(p, _)| p == pattern) {
                Some((_, count)) => *count += hits,
                None => counts.push((*pattern, hits)),
            }
        }

        if let Some(caps) = NOTE_RE.captures(line) {
            let note = caps[2].to_string();
            if caps[1].eq_ignore_ascii_case("LEARNING") {
                analysis.learnings.push(note);
            } else {
                analysis.next_actions.push(note);
            }
        }

        for caps in QUOTED_SPAN_RE.captures_iter(line) {
            let span = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str());
            if let Some(span) = span
                && looks_like_path(span)
            {
                analysis.files_modified.insert(span.to_string());
            }
        }
    }

    for caps in PHASE_RE.captures_iter(text) {
        if let Ok(n) = caps[1].parse::<u32>() {
            analysis.phase_completions.insert(PhaseTag::Phase(n));
        }
    }
    if TESTS_PASSING_RE.is_match(text) {
        analysis.phase_completions.insert(PhaseTag::TestsPassing);
    }
    if IMPLEMENTATION_RE.is_match(text) {
        analysis
            .phase_completions
            .insert(PhaseTag::ImplementationComplete);
    }
    if SETUP_RE.is_match(text) {
        analysis.phase_completions.insert(PhaseTag::SetupDone);
    }
}

fn scan_tests(text: &str, analysis: &mut TranscriptAnalysis) {
    let passed = TEST_PASS_RE.is_match(text);
    let failed = TEST_FAIL_RE.is_match(text);
    analysis.tests_passed |= passed;
    analysis.tests_failed |= failed;
    analysis.tests_run |= passed || failed || TEST_RUN_RE.is_match(text);
}

fn is_modifying_tool(name: &str) -> bool {
    if MODIFYING_TOOLS.contains(&name) {
        return true;
    }
    let lower = name.to_ascii_lowercase();
    lower.contains("write") || lower.contains("edit")
}

fn looks_like_path(span: &str) -> bool {
    if span.contains("://") || !PATH_SHAPE_RE.is_match(span) {
        return false;
    }
    let has_separator = span.contains('/') && span.chars().any(|c| c.is_ascii_alphanumeric());
    has_separator || EXTENSION_RE.is_match(span)
}

fn truncate(line: &str, max_chars: usize) -> String {
    match line.char_indices().nth(max_chars) {
        Some((idx, _)) => line[..idx].to_string(),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transcript::parse_transcript;

    fn assistant(text: &str) -> String {
        serde_json::json!({"role": "assistant", "content": text}).to_string()
    }

    fn analyze_lines(lines: &[String]) -> TranscriptAnalysis {
        analyze(&parse_transcript(&lines.join("\n")))
    }

    #[test]
    fn counts_repeated_errors_by_count_then_discovery() {
        let analysis = analyze_lines(&[
            assistant("permission denied writing cache"),
            assistant("error: could not compile `app`"),
            assistant("permission denied again"),
            assistant("could not compile `app` again"),
            assistant("could not compile `app` a third time"),
        ]);
        assert_eq!(analysis.errors.len(), 5);
        assert_eq!(
            analysis.repeated_errors,
            vec![
                RepeatedError {
                    pattern: ErrorPattern::CompilationError,
                    count: 3
                },
                RepeatedError {
                    pattern: ErrorPattern::PermissionDenied,
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn ties_keep_discovery_order() {
        let analysis = analyze_lines(&[
            assistant("request timed out"),
            assistant("No such file or directory"),
            assistant("timed out again"),
            assistant("file not found: config.toml"),
        ]);
        let order: Vec<_> = analysis.repeated_errors.iter().map(|r| r.pattern).collect();
        assert_eq!(order, vec![ErrorPattern::Timeout, ErrorPattern::MissingFile]);
    }

    #[test]
    fn every_match_on_a_line_counts() {
        let analysis = analyze_lines(&[assistant("syntax error: syntax error near token")]);
        assert_eq!(analysis.errors.len(), 2);
        assert_eq!(
            analysis.repeated_errors,
            vec![RepeatedError {
                pattern: ErrorPattern::SyntaxError,
                count: 2
            }]
        );
    }

    #[test]
    fn five_occurrences_yield_one_entry_with_count_five() {
        let analysis = analyze_lines(&[
            assistant("timeout; timeout; timeout"),
            assistant("request timed out"),
            assistant("deadline exceeded while fetching"),
        ]);
        assert_eq!(analysis.errors.len(), 5);
        assert_eq!(
            analysis.repeated_errors,
            vec![RepeatedError {
                pattern: ErrorPattern::Timeout,
                count: 5
            }]
        );

        let one_line = analyze_lines(&[assistant("timeout; timeout; timeout; timeout; timeout")]);
        assert_eq!(one_line.repeated_errors.len(), 1);
        assert_eq!(one_line.repeated_errors[0].count, 5);
    }

    #[test]
    fn user_mission_does_not_count_as_progress() {
        let user = serde_json::json!({
            "type": "user",
            "message": {"role": "user", "content": "Make `cargo test` pass for the workspace."}
        })
        .to_string();
        let system = serde_json::json!({"role": "system", "content": "tests passed: 3 passed"})
            .to_string();
        let analysis = analyze_lines(&[user, system, assistant("ok")]);
        assert!(!analysis.tests_run);
        assert!(!analysis.tests_passed);
        assert!(analysis.files_modified.is_empty());
        assert!(!analysis.meaningful_changes);
    }

    #[test]
    fn samples_are_truncated() {
        let long = format!("permission denied {}", "x".repeat(400));
        let analysis = analyze_lines(&[assistant(&long)]);
        assert_eq!(analysis.errors[0].sample.chars().count(), SAMPLE_MAX_CHARS);
    }

    #[test]
    fn user_text_does_not_produce_errors() {
        let user = serde_json::json!({"role": "user", "content": "fix the syntax error"}).to_string();
        let analysis = analyze_lines(&[user]);
        assert!(analysis.errors.is_empty());
    }

    #[test]
    fn detects_modified_files_from_tools_and_text() {
        let edit = serde_json::json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "name": "Edit", "input": {"file_path": "src/main.rs"}},
                {"type": "tool_use", "name": "Read", "input": {"file_path": "README.md"}},
                {"type": "tool_use", "name": "mcp__fs__write_file", "input": {"path": "docs/a.md"}}
            ]}
        })
        .to_string();
        let analysis = analyze_lines(&[
            edit,
            assistant("Updated `src/main.rs` and \"Cargo.toml\", see https://x.io/y and `e.g.`"),
        ]);
        let files: Vec<_> = analysis.files_modified.iter().cloned().collect();
        assert_eq!(files, vec!["Cargo.toml", "docs/a.md", "src/main.rs"]);
        assert!(analysis.meaningful_changes);
    }

    #[test]
    fn test_flags_are_independent() {
        let bash = serde_json::json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "name": "Bash", "input": {"command": "cargo test --all"}}
            ]}
        })
        .to_string();
        let result = serde_json::json!({
            "type": "user",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "content": "test result: FAILED. 3 passed; 1 failed"}
            ]}
        })
        .to_string();
        let analysis = analyze_lines(&[bash, result]);
        assert!(analysis.tests_run);
        assert!(analysis.tests_passed);
        assert!(analysis.tests_failed);
    }

    #[test]
    fn zero_failures_are_not_failures() {
        let analysis = analyze_lines(&[assistant("test result: ok. 12 passed; 0 failed")]);
        assert!(analysis.tests_passed);
        assert!(!analysis.tests_failed);
    }

    #[test]
    fn recognises_phase_completions() {
        let analysis = analyze_lines(&[assistant(
            "Phase 2 completed.\nAll tests pass now.\nImplementation complete. Setup is done.",
        )]);
        let phases: Vec<_> = analysis.phase_completions.iter().copied().collect();
        assert_eq!(
            phases,
            vec![
                PhaseTag::Phase(2),
                PhaseTag::TestsPassing,
                PhaseTag::ImplementationComplete,
                PhaseTag::SetupDone,
            ]
        );
    }

    #[test]
    fn extracts_learning_and_next_notes() {
        let analysis = analyze_lines(&[assistant(
            "LEARNING: the api needs auth\n- next: wire up retries\nnothing here",
        )]);
        assert_eq!(analysis.learnings, vec!["the api needs auth"]);
        assert_eq!(analysis.next_actions, vec!["wire up retries"]);
    }

    #[test]
    fn short_chatter_is_not_meaningful() {
        let analysis = analyze_lines(&[assistant("Looking into it.")]);
        assert!(!analysis.meaningful_changes);

        let fenced = analyze_lines(&[assistant("```\nfn main() {}\n```")]);
        assert!(fenced.meaningful_changes);

        let long = analyze_lines(&[assistant(&"word ".repeat(120))]);
        assert!(long.meaningful_changes);
    }

    #[test]
    fn empty_transcript_yields_default_analysis() {
        assert_eq!(analyze(&Transcript::default()), TranscriptAnalysis::default());
    }
}
