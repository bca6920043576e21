//! Durable memory store: trait, file-backed project store and guarded client.
//!
//! The orchestration only talks to [`MemoryClient`], which turns every store
//! failure into a warning and an empty result. Loop start is the one caller
//! that treats an unavailable store as fatal, via
//! [`MemoryClient::require_available`].

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Architecture,
    Decisions,
    Reports,
    Notes,
    Summaries,
    Structure,
}

/// Immutable record in the memory store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub category: MemoryCategory,
    pub title: String,
    pub content: String,
    pub tags: BTreeSet<String>,
    /// 1..=10, higher ranks first on equal relevance.
    pub importance: u8,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// Entry this one replaces; superseded entries are hidden from search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
}

/// Entry contents before the store assigns an id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMemory {
    pub category: MemoryCategory,
    pub title: String,
    pub content: String,
    pub tags: BTreeSet<String>,
    pub importance: u8,
    pub session_id: String,
    pub supersedes: Option<String>,
}

impl NewMemory {
    pub fn new(
        category: MemoryCategory,
        session_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            category,
            title: title.into(),
            content: content.into(),
            tags: BTreeSet::new(),
            importance: 5,
            session_id: session_id.into(),
            supersedes: None,
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn importance(mut self, importance: u8) -> Self {
        self.importance = importance.clamp(1, 10);
        self
    }

    pub fn supersedes(mut self, id: Option<String>) -> Self {
        self.supersedes = id;
        self
    }

    /// Materialize the entry once the store has assigned an id and timestamp.
    pub fn into_entry(self, id: String, created_at: DateTime<Utc>) -> MemoryEntry {
        MemoryEntry {
            id,
            category: self.category,
            title: self.title,
            content: self.content,
            tags: self.tags,
            importance: self.importance.clamp(1, 10),
            session_id: self.session_id,
            created_at,
            supersedes: self.supersedes,
        }
    }
}

/// Search request. Every filter is conjunctive; `tags` must all be present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryQuery {
    pub query: String,
    pub tags: BTreeSet<String>,
    pub category: Option<MemoryCategory>,
    pub importance_min: Option<u8>,
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

impl MemoryQuery {
    pub fn tagged(tag: &str) -> Self {
        Self {
            tags: BTreeSet::from([tag.to_string()]),
            ..Self::default()
        }
    }

    pub fn in_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMemory {
    pub entry: MemoryEntry,
    /// Relevance in `[0, 1]`; 1.0 for an empty query.
    pub score: f64,
}

/// Capability interface to the durable memory store.
pub trait MemoryStore {
    fn is_available(&self) -> bool;
    fn store(&self, memory: NewMemory) -> Result<String>;
    fn search(&self, query: &MemoryQuery) -> Result<Vec<ScoredMemory>>;
    fn get(&self, id: &str) -> Result<Option<MemoryEntry>>;
}

/// The project memory store has not been initialized.
#[derive(Debug)]
pub struct MemoryUnavailableError;

impl fmt::Display for MemoryUnavailableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory store unavailable (run `autoloop memory init` first)")
    }
}

impl std::error::Error for MemoryUnavailableError {}

/// Generate a store-unique entry id.
pub fn new_memory_id(now: DateTime<Utc>) -> String {
    format!(
        "mem-{}-{:08x}",
        now.format("%Y%m%d%H%M%S%3f"),
        rand::random::<u32>()
    )
}

/// Filter, score and order `entries` for `query`.
///
/// Ordering: score, importance, recency, then later-written first.
pub fn rank_entries(entries: &[MemoryEntry], query: &MemoryQuery) -> Vec<ScoredMemory> {
    let superseded: HashSet<&str> = entries
        .iter()
        .filter_map(|e| e.supersedes.as_deref())
        .collect();
    let terms = query_terms(&query.query);

    let mut scored: Vec<(usize, ScoredMemory)> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| !superseded.contains(e.id.as_str()))
        .filter(|(_, e)| query.tags.is_subset(&e.tags))
        .filter(|(_, e)| query.category.is_none_or(|c| c == e.category))
        .filter(|(_, e)| query.importance_min.is_none_or(|min| e.importance >= min))
        .filter(|(_, e)| {
            query
                .session_id
                .as_deref()
                .is_none_or(|s| s == e.session_id)
        })
        .filter_map(|(idx, e)| {
            let score = relevance(e, &terms);
            (score > 0.0).then(|| {
                (
                    idx,
                    ScoredMemory {
                        entry: e.clone(),
                        score,
                    },
                )
            })
        })
        .collect();

    scored.sort_by(|(ia, a), (ib, b)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.entry.importance.cmp(&a.entry.importance))
            .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
            .then_with(|| ib.cmp(ia))
    });
    let limit = query.limit.unwrap_or(usize::MAX);
    scored.into_iter().take(limit).map(|(_, s)| s).collect()
}

fn query_terms(query: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    query
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() >= 2)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Fraction of terms found; a title hit counts double a body or tag hit.
fn relevance(entry: &MemoryEntry, terms: &[String]) -> f64 {
    if terms.is_empty() {
        return 1.0;
    }
    let title = entry.title.to_lowercase();
    let body = entry.content.to_lowercase();
    let hits: f64 = terms
        .iter()
        .map(|term| {
            if title.contains(term.as_str()) {
                1.0
            } else if body.contains(term.as_str()) || entry.tags.iter().any(|t| t == term) {
                0.5
            } else {
                0.0
            }
        })
        .sum();
    (hits / terms.len() as f64).min(1.0)
}

/// Project store backed by an append-only JSONL file.
#[derive(Debug, Clone)]
pub struct FileMemoryStore {
    dir: PathBuf,
    path: PathBuf,
}

impl FileMemoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join("entries.jsonl");
        Self { dir, path }
    }

    /// Create the store on disk. Existing entries are kept.
    pub fn init(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(dir);
        fs::create_dir_all(&store.dir)
            .with_context(|| format!("create directory {}", store.dir.display()))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&store.path)
            .with_context(|| format!("create memory file {}", store.path.display()))?;
        debug!(path = %store.path.display(), "memory store initialized");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<MemoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read memory file {}", self.path.display()))?;
        let mut entries = Vec::new();
        let mut skipped = 0usize;
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<MemoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(path = %self.path.display(), skipped, "skipped malformed memory entries");
        }
        Ok(entries)
    }
}

impl MemoryStore for FileMemoryStore {
    fn is_available(&self) -> bool {
        self.dir.is_dir()
    }

    fn store(&self, memory: NewMemory) -> Result<String> {
        if !self.is_available() {
            return Err(anyhow::Error::new(MemoryUnavailableError));
        }
        let now = Utc::now();
        let entry = memory.into_entry(new_memory_id(now), now);
        let mut line = serde_json::to_string(&entry).context("serialize memory entry")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open memory file {}", self.path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("lock memory file {}", self.path.display()))?;
        let written = file
            .write_all(line.as_bytes())
            .with_context(|| format!("append memory file {}", self.path.display()));
        if let Err(err) = FileExt::unlock(&file) {
            warn!(path = %self.path.display(), error = %err, "failed to unlock memory file");
        }
        written?;
        debug!(id = %entry.id, category = ?entry.category, "memory stored");
        Ok(entry.id)
    }

    fn search(&self, query: &MemoryQuery) -> Result<Vec<ScoredMemory>> {
        if !self.is_available() {
            return Err(anyhow::Error::new(MemoryUnavailableError));
        }
        Ok(rank_entries(&self.read_all()?, query))
    }

    fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        if !self.is_available() {
            return Err(anyhow::Error::new(MemoryUnavailableError));
        }
        Ok(self.read_all()?.into_iter().find(|e| e.id == id))
    }
}

/// Well-known tags written by the loop.
pub mod tags {
    pub const OBJECTIVE: &str = "objective";
    pub const STATUS: &str = "status";
    pub const NEXT_ACTIONS: &str = "next-actions";
    pub const ACCOMPLISHMENT: &str = "accomplishment";
    pub const FAILURE: &str = "failure";
    pub const LEARNING: &str = "learning";
    pub const HANDOFF: &str = "handoff";
}

/// Guarded access to a memory store. Failures degrade to empty results.
#[derive(Clone, Copy)]
pub struct MemoryClient<'a> {
    store: &'a dyn MemoryStore,
}

impl<'a> MemoryClient<'a> {
    pub fn new(store: &'a dyn MemoryStore) -> Self {
        Self { store }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_available()
    }

    /// Hard precondition for starting a loop.
    pub fn require_available(&self) -> Result<()> {
        if self.store.is_available() {
            Ok(())
        } else {
            Err(anyhow::Error::new(MemoryUnavailableError))
        }
    }

    pub fn store(&self, memory: NewMemory) -> Option<String> {
        if !self.store.is_available() {
            warn!(title = %memory.title, "memory store unavailable; entry not stored");
            return None;
        }
        match self.store.store(memory) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "memory store write failed");
                None
            }
        }
    }

    pub fn search(&self, query: &MemoryQuery) -> Vec<ScoredMemory> {
        if !self.store.is_available() {
            debug!("memory store unavailable; empty search result");
            return Vec::new();
        }
        self.store.search(query).unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "memory search failed");
            Vec::new()
        })
    }

    pub fn get(&self, id: &str) -> Option<MemoryEntry> {
        if !self.store.is_available() {
            return None;
        }
        self.store.get(id).unwrap_or_else(|err| {
            warn!(id, error = %format!("{err:#}"), "memory get failed");
            None
        })
    }

    /// Newest entry in the session carrying `tag`.
    pub fn latest(&self, session_id: &str, tag: &str) -> Option<MemoryEntry> {
        self.session_entries(session_id, tag).pop()
    }

    pub fn record_objective(&self, session_id: &str, objective: &str) -> Option<String> {
        self.store(
            NewMemory::new(
                MemoryCategory::Summaries,
                session_id,
                "Loop objective",
                objective,
            )
            .tag(tags::OBJECTIVE)
            .importance(10),
        )
    }

    pub fn objective(&self, session_id: &str) -> Option<String> {
        self.latest(session_id, tags::OBJECTIVE)
            .map(|e| e.content)
            .filter(|c| !c.trim().is_empty())
    }

    pub fn record_status(&self, session_id: &str, iteration: u32, status: &str) -> Option<String> {
        self.store(
            NewMemory::new(
                MemoryCategory::Reports,
                session_id,
                format!("Status after iteration {iteration}"),
                status,
            )
            .tag(tags::STATUS)
            .importance(6),
        )
    }

    pub fn latest_status(&self, session_id: &str) -> Option<String> {
        self.latest(session_id, tags::STATUS).map(|e| e.content)
    }

    pub fn record_next_actions(
        &self,
        session_id: &str,
        iteration: u32,
        actions: &[String],
    ) -> Option<String> {
        if actions.is_empty() {
            return None;
        }
        self.store(
            NewMemory::new(
                MemoryCategory::Notes,
                session_id,
                format!("Next actions after iteration {iteration}"),
                actions.join("\n"),
            )
            .tag(tags::NEXT_ACTIONS)
            .importance(7),
        )
    }

    pub fn latest_next_actions(&self, session_id: &str) -> Vec<String> {
        self.latest(session_id, tags::NEXT_ACTIONS)
            .map(|e| split_lines(&e.content))
            .unwrap_or_default()
    }

    pub fn record_accomplishment(
        &self,
        session_id: &str,
        iteration: u32,
        summary: &str,
    ) -> Option<String> {
        self.store(
            NewMemory::new(
                MemoryCategory::Reports,
                session_id,
                format!("Iteration {iteration} progress"),
                summary,
            )
            .tag(tags::ACCOMPLISHMENT)
            .importance(5),
        )
    }

    pub fn record_failure(
        &self,
        session_id: &str,
        iteration: u32,
        label: &str,
        sample: &str,
    ) -> Option<String> {
        self.store(
            NewMemory::new(
                MemoryCategory::Reports,
                session_id,
                format!("Iteration {iteration}: {label}"),
                sample,
            )
            .tag(tags::FAILURE)
            .tag(label.replace(' ', "-"))
            .importance(6),
        )
    }

    pub fn record_learning(&self, session_id: &str, iteration: u32, learning: &str) -> Option<String> {
        self.store(
            NewMemory::new(
                MemoryCategory::Notes,
                session_id,
                format!("Learning from iteration {iteration}"),
                learning,
            )
            .tag(tags::LEARNING)
            .importance(7),
        )
    }

    /// Session entries carrying `tag`, oldest first.
    fn session_entries(&self, session_id: &str, tag: &str) -> Vec<MemoryEntry> {
        // Search yields later writes first on ties; reverse before the stable sort.
        let mut entries: Vec<MemoryEntry> = self
            .search(&MemoryQuery::tagged(tag).in_session(session_id))
            .into_iter()
            .rev()
            .map(|s| s.entry)
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    /// Contents of session entries carrying `tag`, oldest first.
    pub fn session_contents(&self, session_id: &str, tag: &str) -> Vec<String> {
        self.session_entries(session_id, tag)
            .into_iter()
            .map(|e| e.content)
            .collect()
    }

    /// Learnings recorded in this session, oldest first.
    pub fn session_learnings(&self, session_id: &str) -> Vec<String> {
        self.session_contents(session_id, tags::LEARNING)
    }

    /// Learnings from other sessions relevant to `query` at or above `min_relevance`.
    pub fn cross_session_learnings(
        &self,
        session_id: &str,
        query: &str,
        min_relevance: f64,
        limit: usize,
    ) -> Vec<String> {
        let query = MemoryQuery {
            query: query.to_string(),
            tags: BTreeSet::from([tags::LEARNING.to_string()]),
            ..MemoryQuery::default()
        };
        self.search(&query)
            .into_iter()
            .filter(|s| s.entry.session_id != session_id && s.score >= min_relevance)
            .take(limit)
            .map(|s| s.entry.content)
            .collect()
    }
}

fn split_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
