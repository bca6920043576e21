//! Test-only fakes: an in-memory memory store, scripted agents and cycle
//! runners, and a temp workspace with transcript helpers.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;

use crate::core::cycle::CycleExit;
use crate::core::state::{LoopOptions, LoopState};
use crate::io::executor::{Agent, AgentRequest};
use crate::io::init::LoopPaths;
use crate::io::loop_state::load_loop_state;
use crate::io::memory::{
    MemoryEntry, MemoryQuery, MemoryStore, MemoryUnavailableError, NewMemory, ScoredMemory,
    rank_entries,
};
use crate::start::start_loop;
use crate::supervisor::{CycleRequest, CycleRunner};

/// Memory store kept in a `Vec`, with a clock that ticks one second per write.
pub struct InMemoryStore {
    entries: RefCell<Vec<MemoryEntry>>,
    available: bool,
    ticks: Cell<i64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            available: true,
            ticks: Cell::new(0),
        }
    }

    /// A store that rejects every call, as when the store was never initialized.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.borrow().clone()
    }

    fn check(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(anyhow::Error::new(MemoryUnavailableError))
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore for InMemoryStore {
    fn is_available(&self) -> bool {
        self.available
    }

    fn store(&self, memory: NewMemory) -> Result<String> {
        self.check()?;
        let tick = self.ticks.get() + 1;
        self.ticks.set(tick);
        let id = format!("mem-{tick:04}");
        let created_at = DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(tick);
        self.entries
            .borrow_mut()
            .push(memory.into_entry(id.clone(), created_at));
        Ok(id)
    }

    fn search(&self, query: &MemoryQuery) -> Result<Vec<ScoredMemory>> {
        self.check()?;
        Ok(rank_entries(&self.entries.borrow(), query))
    }

    fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        self.check()?;
        Ok(self.entries.borrow().iter().find(|e| e.id == id).cloned())
    }
}

/// Agent that writes one scripted transcript per invocation.
pub struct ScriptedAgent {
    transcripts: RefCell<VecDeque<Vec<String>>>,
    prompts: RefCell<Vec<String>>,
    resumes: RefCell<Vec<Option<String>>>,
}

impl ScriptedAgent {
    pub fn new(transcripts: Vec<Vec<String>>) -> Self {
        Self {
            transcripts: RefCell::new(transcripts.into()),
            prompts: RefCell::new(Vec::new()),
            resumes: RefCell::new(Vec::new()),
        }
    }

    /// Prompts received, in invocation order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn resumes(&self) -> Vec<Option<String>> {
        self.resumes.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.transcripts.borrow().len();
        assert_eq!(left, 0, "scripted agent has {left} unused transcripts");
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<()> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        self.resumes.borrow_mut().push(request.resume.clone());
        let lines = self
            .transcripts
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent exhausted"))?;
        if let Some(parent) = request.transcript_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.transcript_path, join_lines(&lines))?;
        Ok(())
    }
}

/// Cycle runner that replays scripted exits and records each launch.
pub struct ScriptedCycleRunner {
    exits: RefCell<VecDeque<CycleExit>>,
    launches: RefCell<Vec<(u32, u32)>>,
}

impl ScriptedCycleRunner {
    pub fn new(exits: Vec<CycleExit>) -> Self {
        Self {
            exits: RefCell::new(exits.into()),
            launches: RefCell::new(Vec::new()),
        }
    }

    /// Cycle number of every launch.
    pub fn cycles(&self) -> Vec<u32> {
        self.launches.borrow().iter().map(|(c, _)| *c).collect()
    }

    /// Attempt number of every launch.
    pub fn attempts(&self) -> Vec<u32> {
        self.launches.borrow().iter().map(|(_, a)| *a).collect()
    }
}

impl CycleRunner for ScriptedCycleRunner {
    fn run_cycle(&self, request: &CycleRequest) -> CycleExit {
        self.launches
            .borrow_mut()
            .push((request.cycle, request.attempt));
        self.exits
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| CycleExit::Failed {
                code: None,
                detail: "scripted cycle runner exhausted".to_string(),
                retryable: false,
            })
    }
}

/// Temporary project root with helpers for loops and transcripts.
pub struct TestWorkspace {
    temp: tempfile::TempDir,
    transcripts: Cell<u32>,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().expect("tempdir"),
            transcripts: Cell::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Start a loop and return its session id.
    pub fn start_loop(&self, store: &dyn MemoryStore, prompt: &str, options: &LoopOptions) -> String {
        start_loop(self.root(), store, prompt, options)
            .expect("start loop")
            .session_id
    }

    pub fn state(&self) -> Option<LoopState> {
        load_loop_state(&LoopPaths::new(self.root()).loop_state_path).expect("load loop state")
    }

    /// Write a transcript outside `.autoloop/` and return its path.
    pub fn write_transcript(&self, lines: &[String]) -> PathBuf {
        let n = self.transcripts.get() + 1;
        self.transcripts.set(n);
        let path = self.root().join("transcripts").join(format!("t{n}.jsonl"));
        fs::create_dir_all(path.parent().expect("parent")).expect("transcripts dir");
        fs::write(&path, join_lines(lines)).expect("write transcript");
        path
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Assistant message with a single text block.
pub fn assistant_line(text: &str) -> String {
    json!({
        "type": "assistant",
        "message": {"role": "assistant", "content": [{"type": "text", "text": text}]},
    })
    .to_string()
}

pub fn user_line(text: &str) -> String {
    json!({
        "type": "user",
        "message": {"role": "user", "content": text},
    })
    .to_string()
}

/// Assistant `tool_use` block with an optional target path and shell command.
pub fn tool_use_line(name: &str, path: Option<&str>, command: Option<&str>) -> String {
    let mut input = serde_json::Map::new();
    if let Some(path) = path {
        input.insert("file_path".to_string(), json!(path));
    }
    if let Some(command) = command {
        input.insert("command".to_string(), json!(command));
    }
    json!({
        "type": "assistant",
        "message": {
            "role": "assistant",
            "content": [{"type": "tool_use", "name": name, "input": input}],
        },
    })
    .to_string()
}

/// Final `result` event reporting `input_tokens` of context usage.
pub fn result_line(input_tokens: u64) -> String {
    json!({
        "type": "result",
        "session_id": "agent-session-1",
        "usage": {"input_tokens": input_tokens, "output_tokens": 0},
    })
    .to_string()
}
