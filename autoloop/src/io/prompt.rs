//! Context builder: the prompt injected at each iteration boundary.

use std::collections::HashSet;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::state::LoopState;
use crate::core::types::{StrategyResult, TranscriptAnalysis};

const CONTEXT_TEMPLATE: &str = include_str!("prompts/context.md");

/// Learnings kept in the prompt, session and cross-session combined.
/// Older session learnings are dropped first.
pub const MAX_LEARNINGS: usize = 5;
pub const MAX_NEXT_ACTIONS: usize = 5;
pub const MAX_ERRORS: usize = 3;

const NO_OBJECTIVE: &str = "No objective recorded. Re-read the original mission below and \
     restate the objective before acting.";

/// Memory-derived inputs, already queried and filtered by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryContext {
    pub objective: Option<String>,
    pub status: Option<String>,
    pub next_actions: Vec<String>,
    /// Session learnings, oldest first.
    pub learnings: Vec<String>,
    /// Cross-session learnings that passed the relevance filter.
    pub shared_learnings: Vec<String>,
}

/// Everything the builder reads for one boundary.
#[derive(Debug, Clone, Copy)]
pub struct ContextInputs<'a> {
    pub state: &'a LoopState,
    pub strategy: &'a StrategyResult,
    pub analysis: &'a TranscriptAnalysis,
    /// One-time operator instruction.
    pub nudge: Option<&'a str>,
    pub memory: &'a MemoryContext,
    /// Set when a notify-mode checkpoint is due.
    pub checkpoint_notice: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct StrategyView<'a> {
    name: &'a str,
    reason: &'a str,
    guidance: &'a [String],
}

#[derive(Debug, Serialize)]
struct ErrorView<'a> {
    label: &'a str,
    sample: &'a str,
}

/// Renders the iteration context within a soft byte budget.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    budget_bytes: usize,
}

impl ContextBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &ContextInputs<'_>) -> Result<String> {
        let rendered = render(input)?;
        let mut sections = parse_sections(&rendered);
        // The original mission goes last, byte for byte, and is never dropped.
        let original = format!("## ORIGINAL MISSION\n{}", input.state.prompt);
        apply_budget_to_sections(&mut sections, self.budget_bytes.saturating_sub(original.len()));
        let mut content = render_sections(&sections);
        content.push_str("\n\n");
        content.push_str(&original);
        if !content.ends_with('\n') {
            content.push('\n');
        }
        Ok(content)
    }
}

fn render(input: &ContextInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("context", CONTEXT_TEMPLATE)
        .context("load context template")?;
    let template = env.get_template("context")?;

    let state = input.state;
    let memory = input.memory;
    let non_empty = |s: &Option<String>| {
        s.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let mission = non_empty(&memory.objective)
        .or_else(|| Some(state.prompt.trim().to_string()).filter(|p| !p.is_empty()))
        .unwrap_or_else(|| NO_OBJECTIVE.to_string());

    let learnings = if memory.learnings.is_empty() {
        &input.analysis.learnings
    } else {
        &memory.learnings
    };
    let next_actions = if memory.next_actions.is_empty() {
        &input.analysis.next_actions
    } else {
        &memory.next_actions
    };

    let strategy = StrategyView {
        name: input.strategy.strategy.as_str(),
        reason: &input.strategy.reason,
        guidance: &input.strategy.guidance,
    };

    let rendered = template.render(context! {
        iteration => state.next_iteration(),
        max_iterations => state.max_iterations,
        cycle => state.cycle,
        checkpoint => input.checkpoint_notice,
        mission => mission,
        strategy => strategy,
        status => non_empty(&memory.status),
        next_actions => &next_actions[..next_actions.len().min(MAX_NEXT_ACTIONS)],
        learnings => key_learnings(learnings, &memory.shared_learnings),
        errors => recent_errors(input.analysis),
        nudge => input.nudge.map(str::trim).filter(|s| !s.is_empty()),
        promise => state.completion_promise.as_deref(),
    })?;
    Ok(rendered)
}

fn most_recent(items: &[String], n: usize) -> &[String] {
    &items[items.len().saturating_sub(n)..]
}

/// Most recent session learnings, topped up with cross-session ones, at
/// most [`MAX_LEARNINGS`] in total.
fn key_learnings(session: &[String], shared: &[String]) -> Vec<String> {
    let own = most_recent(session, MAX_LEARNINGS);
    own.iter()
        .cloned()
        .chain(
            shared
                .iter()
                .take(MAX_LEARNINGS - own.len())
                .map(|learning| format!("(earlier session) {learning}")),
        )
        .collect()
}

/// First sample per pattern, in discovery order, at most [`MAX_ERRORS`].
fn recent_errors(analysis: &TranscriptAnalysis) -> Vec<ErrorView<'_>> {
    let mut seen = HashSet::new();
    analysis
        .errors
        .iter()
        .filter(|e| seen.insert(e.pattern))
        .take(MAX_ERRORS)
        .map(|e| ErrorView {
            label: e.pattern.label(),
            sample: &e.sample,
        })
        .collect()
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    /// Required sections are never dropped.
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`. Sections
/// that render empty are omitted.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    use std::sync::LazyLock;
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex")
    });

    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(matches.len());
    for (i, caps) in matches.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = matches
            .get(i + 1)
            .and_then(|m| m.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if content.is_empty() {
            continue;
        }
        sections.push(ParsedSection {
            key: key.as_str().to_string(),
            required: kind.as_str() == "required",
            content,
        });
    }
    sections
}

/// Drop droppable sections until the prompt fits the budget.
///
/// Drop order: learnings -> status -> errors. Required sections are kept in
/// full even when the budget is still exceeded.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in ["learnings", "status", "errors"] {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }
    if total_len(sections) > budget {
        debug!(
            bytes = total_len(sections),
            budget, "context exceeds budget with required sections only"
        );
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
