//! Cycle handoff records: save, load and continuation framing.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::memory::{MemoryCategory, MemoryClient, NewMemory, tags};
use crate::core::state::LoopState;

const MAX_ACCOMPLISHMENTS: usize = 10;
const MAX_BLOCKERS: usize = 5;
const MAX_LEARNINGS: usize = 5;

/// Durable record letting a fresh cycle continue a session's objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleHandoff {
    pub session_id: String,
    pub cycle_number: u32,
    pub original_objective: String,
    pub context_pct: f64,
    #[serde(default)]
    pub accomplishments: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub next_actions: Vec<String>,
    #[serde(default)]
    pub key_learnings: Vec<String>,
}

/// Result of `autoloop handoff load`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffLoad {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandoffLoad {
    fn missing(error: Option<String>) -> Self {
        Self {
            found: false,
            formatted_context: None,
            error,
        }
    }
}

/// Store `handoff`, superseding the session's previous handoff.
///
/// Returns the new entry id, or `None` when the store could not be written.
pub fn save_handoff(memory: &MemoryClient<'_>, handoff: &CycleHandoff) -> Option<String> {
    let content = match serde_json::to_string_pretty(handoff) {
        Ok(content) => content,
        Err(err) => {
            warn!(error = %err, "serialize handoff");
            return None;
        }
    };
    let previous = memory
        .latest(&handoff.session_id, tags::HANDOFF)
        .map(|entry| entry.id);
    let id = memory.store(
        NewMemory::new(
            MemoryCategory::Summaries,
            &handoff.session_id,
            format!("Cycle {} handoff", handoff.cycle_number),
            content,
        )
        .tag(tags::HANDOFF)
        .tag(format!("cycle-{}", handoff.cycle_number))
        .importance(9)
        .supersedes(previous),
    )?;
    info!(
        session_id = %handoff.session_id,
        cycle = handoff.cycle_number,
        context_pct = handoff.context_pct,
        id = %id,
        "handoff saved"
    );
    Some(id)
}

/// Most recent handoff for the session, if any parses.
pub fn latest_handoff(memory: &MemoryClient<'_>, session_id: &str) -> Option<CycleHandoff> {
    let entry = memory.latest(session_id, tags::HANDOFF)?;
    match serde_json::from_str(&entry.content) {
        Ok(handoff) => Some(handoff),
        Err(err) => {
            warn!(id = %entry.id, error = %err, "malformed handoff entry");
            None
        }
    }
}

pub fn load_handoff(memory: &MemoryClient<'_>, session_id: &str) -> HandoffLoad {
    if !memory.is_available() {
        return HandoffLoad::missing(Some("memory store unavailable".to_string()));
    }
    let Some(entry) = memory.latest(session_id, tags::HANDOFF) else {
        debug!(session_id, "no handoff recorded");
        return HandoffLoad::missing(None);
    };
    match serde_json::from_str::<CycleHandoff>(&entry.content) {
        Ok(handoff) => HandoffLoad {
            found: true,
            formatted_context: Some(format_continuation(&handoff)),
            error: None,
        },
        Err(err) => HandoffLoad::missing(Some(format!(
            "malformed handoff entry {}: {err}",
            entry.id
        ))),
    }
}

/// Continuation frame prepended to the first prompt of a new cycle.
pub fn format_continuation(handoff: &CycleHandoff) -> String {
    let mut out = format!(
        "## CONTINUATION (cycle {}, session {})\n\n\
         The previous cycle ended at {:.0}% of the context window and handed off. \
         Your mission is unchanged; continue from where it stopped.\n\n\
         ### Mission (unchanged)\n{}\n",
        handoff.cycle_number + 1,
        handoff.session_id,
        handoff.context_pct,
        handoff.original_objective.trim(),
    );
    push_list(&mut out, "Accomplished so far", &handoff.accomplishments, false);
    push_list(&mut out, "Current blockers", &handoff.blockers, false);
    push_list(&mut out, "Next actions", &handoff.next_actions, true);
    push_list(&mut out, "Key learnings", &handoff.key_learnings, false);
    out
}

fn push_list(out: &mut String, title: &str, items: &[String], numbered: bool) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n### {title}\n"));
    for (idx, item) in items.iter().enumerate() {
        if numbered {
            out.push_str(&format!("{}. {item}\n", idx + 1));
        } else {
            out.push_str(&format!("- {item}\n"));
        }
    }
}

/// Assemble a handoff from what the session has recorded so far.
pub fn collect_handoff(memory: &MemoryClient<'_>, state: &LoopState, context_pct: f64) -> CycleHandoff {
    let session = state.session_id.as_str();
    let mut blockers = memory.session_contents(session, tags::FAILURE);
    blockers.dedup();
    CycleHandoff {
        session_id: state.session_id.clone(),
        cycle_number: state.cycle,
        original_objective: memory
            .objective(session)
            .unwrap_or_else(|| state.prompt.clone()),
        context_pct,
        accomplishments: last_n(memory.session_contents(session, tags::ACCOMPLISHMENT), MAX_ACCOMPLISHMENTS),
        blockers: last_n(blockers, MAX_BLOCKERS),
        next_actions: memory.latest_next_actions(session),
        key_learnings: last_n(memory.session_learnings(session), MAX_LEARNINGS),
    }
}

fn last_n(mut items: Vec<String>, n: usize) -> Vec<String> {
    if items.len() > n {
        items.drain(..items.len() - n);
    }
    items
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::core::state::LoopOptions;
    use crate::io::memory::{MemoryQuery, MemoryStore};
    use crate::test_support::InMemoryStore;

    fn handoff(cycle: u32) -> CycleHandoff {
        CycleHandoff {
            session_id: "s1".to_string(),
            cycle_number: cycle,
            original_objective: "Build the parser".to_string(),
            context_pct: 63.4,
            accomplishments: vec!["lexer done".to_string()],
            blockers: vec![],
            next_actions: vec!["write grammar".to_string(), "add tests".to_string()],
            key_learnings: vec!["tokens carry spans".to_string()],
        }
    }

    #[test]
    fn load_without_handoff_is_not_found() {
        let store = InMemoryStore::new();
        let load = load_handoff(&MemoryClient::new(&store), "s1");
        assert_eq!(load, HandoffLoad::missing(None));
        let json = serde_json::to_string(&load).expect("json");
        assert_eq!(json, r#"{"found":false}"#);
    }

    #[test]
    fn handoff_json_preserves_every_field() {
        let original = CycleHandoff {
            key_learnings: vec![],
            ..handoff(4)
        };
        let json = serde_json::to_value(&original).expect("serialize");
        assert_eq!(json["blockers"], serde_json::json!([]));
        assert_eq!(json["key_learnings"], serde_json::json!([]));
        assert_eq!(json["cycle_number"], 4);
        let parsed: CycleHandoff = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, original);

        let store = InMemoryStore::new();
        let stored = MemoryClient::new(&store);
        let id = save_handoff(&stored, &original).expect("saved");
        assert!(id.starts_with("mem-"));
        assert_eq!(latest_handoff(&stored, "s1"), Some(original));
    }

    #[test]
    fn unavailable_store_reports_error() {
        let store = InMemoryStore::unavailable();
        let load = load_handoff(&MemoryClient::new(&store), "s1");
        assert!(!load.found);
        assert!(load.error.is_some());
    }

    #[test]
    fn saved_handoff_loads_as_continuation() {
        let store = InMemoryStore::new();
        let memory = MemoryClient::new(&store);
        save_handoff(&memory, &handoff(1)).expect("saved");

        let load = load_handoff(&memory, "s1");
        assert!(load.found);
        let text = load.formatted_context.expect("context");
        assert!(text.contains("cycle 2"));
        assert!(text.contains("Mission (unchanged)\nBuild the parser"));
        assert!(text.contains("1. write grammar\n2. add tests"));
        assert!(!text.contains("Current blockers"));
    }

    #[test]
    fn later_handoff_supersedes_earlier() {
        let store = InMemoryStore::new();
        let memory = MemoryClient::new(&store);
        let first = save_handoff(&memory, &handoff(1)).expect("first");
        save_handoff(&memory, &handoff(2)).expect("second");

        assert_eq!(latest_handoff(&memory, "s1").map(|h| h.cycle_number), Some(2));
        let visible = store
            .search(&MemoryQuery::tagged(tags::HANDOFF))
            .expect("search");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].entry.supersedes.as_deref(), Some(first.as_str()));
        assert!(store.get(&first).expect("get").is_some());
    }

    #[test]
    fn collect_uses_memory_then_falls_back_to_prompt() {
        let store = InMemoryStore::new();
        let memory = MemoryClient::new(&store);
        let mut state = LoopState::new(
            "s1",
            "prompt text",
            &LoopOptions::default(),
            DateTime::<Utc>::UNIX_EPOCH,
        );
        state.cycle = 3;
        let collected = collect_handoff(&memory, &state, 61.0);
        assert_eq!(collected.original_objective, "prompt text");
        assert_eq!(collected.cycle_number, 3);

        for i in 0..7 {
            memory.record_learning("s1", i, &format!("l{i}"));
        }
        memory.record_failure("s1", 2, "timeout", "request timed out");
        memory.record_objective("s1", "stored objective");
        let collected = collect_handoff(&memory, &state, 61.0);
        assert_eq!(collected.original_objective, "stored objective");
        assert_eq!(collected.key_learnings, vec!["l2", "l3", "l4", "l5", "l6"]);
        assert_eq!(collected.blockers, vec!["request timed out"]);
    }
}
