//! Autonomous iteration supervisor.
//!
//! Drives an external agent toward a long-running objective across many
//! invocations. Loop state lives in `.autoloop/state/`, durable knowledge in
//! the project memory store (`.autoloop/memory/`). Every command prints its
//! result as JSON on stdout; diagnostics go to stderr.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use autoloop::boundary::{BoundaryConfig, process_boundary, transcript_path_from_hook};
use autoloop::core::state::LoopOptions;
use autoloop::core::types::CheckpointMode;
use autoloop::exit_codes;
use autoloop::io::config::load_config;
use autoloop::io::executor::CommandAgent;
use autoloop::io::handoff::{CycleHandoff, load_handoff, save_handoff};
use autoloop::io::init::LoopPaths;
use autoloop::io::loop_state::{NoActiveLoopError, load_loop_state};
use autoloop::io::memory::{
    FileMemoryStore, MemoryCategory, MemoryClient, MemoryQuery, MemoryStore, NewMemory,
};
use autoloop::io::signals::write_nudge;
use autoloop::logging;
use autoloop::looping::{CycleConfig, CycleStop, run_cycle};
use autoloop::start::{cancel_loop, loop_status, resume_loop, start_loop};
use autoloop::supervisor::{ProcessCycleRunner, SupervisorConfig, supervise};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "autoloop",
    version,
    about = "Autonomous iteration supervisor for bounded-context agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a loop in the current directory with PROMPT as its mission.
    Start {
        prompt: String,
        /// Iteration cap; 0 = unbounded.
        #[arg(long, default_value_t = 0)]
        max_iterations: u32,
        /// Phrase that ends the loop when emitted as `<promise>PHRASE</promise>`.
        #[arg(long)]
        completion_promise: Option<String>,
        /// Checkpoint every N iterations; 0 disables checkpoints.
        #[arg(long, default_value_t = 0)]
        checkpoint_interval: u32,
        #[arg(long, value_enum, default_value_t = CheckpointMode::Notify)]
        checkpoint_mode: CheckpointMode,
    },
    /// Run one cycle of the active loop (exit 100 = context threshold crossed).
    Run,
    /// Run cycles of the active loop with handoffs and retries.
    Supervise,
    /// Process one iteration boundary and print the decision.
    Boundary {
        /// Transcript to analyze; read from hook JSON on stdin when omitted.
        #[arg(long)]
        transcript: Option<PathBuf>,
    },
    /// Cancel the active loop.
    Cancel,
    /// Print the active loop's status.
    Status,
    /// Queue a one-time instruction for the next iteration.
    Nudge { text: String },
    /// Release a checkpoint pause.
    Resume,
    /// Manage the project memory store.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Save or load cycle handoff records.
    Handoff {
        #[command(subcommand)]
        command: HandoffCommand,
    },
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// Create the project memory store.
    Init,
    /// Store an entry.
    Add {
        #[arg(long, value_enum)]
        category: MemoryCategory,
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, default_value_t = 5)]
        importance: u8,
        #[arg(long, default_value = "operator")]
        session_id: String,
    },
    /// Search entries by relevance.
    Search {
        #[arg(default_value = "")]
        query: String,
        #[arg(long, value_enum)]
        category: Option<MemoryCategory>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        importance_min: Option<u8>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum HandoffCommand {
    /// Store the handoff JSON read from stdin.
    Save,
    /// Print the latest handoff for a session as continuation context.
    Load {
        #[arg(long)]
        session_id: String,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve working directory")?;
    let paths = LoopPaths::new(&root);
    let store = FileMemoryStore::new(&paths.memory_dir);

    match cli.command {
        Command::Start {
            prompt,
            max_iterations,
            completion_promise,
            checkpoint_interval,
            checkpoint_mode,
        } => {
            let options = LoopOptions {
                max_iterations,
                completion_promise,
                checkpoint_interval,
                checkpoint_mode,
            };
            let outcome = start_loop(&root, &store, &prompt, &options)?;
            print_json(&outcome)?;
            Ok(exit_codes::OK)
        }
        Command::Run => cmd_run(&root, &paths, &store),
        Command::Supervise => cmd_supervise(&root, &paths, &store),
        Command::Boundary { transcript } => cmd_boundary(&root, &paths, &store, transcript),
        Command::Cancel => {
            let outcome = cancel_loop(&root)?;
            print_json(&outcome)?;
            Ok(exit_codes::OK)
        }
        Command::Status => {
            match loop_status(&root)? {
                Some(status) => print_json(&status)?,
                None => print_json(&json!({"active": false}))?,
            }
            Ok(exit_codes::OK)
        }
        Command::Nudge { text } => {
            if text.trim().is_empty() {
                return Err(anyhow!("autoloop nudge: text must not be empty"));
            }
            if load_loop_state(&paths.loop_state_path)?.is_none() {
                return Err(anyhow::Error::new(NoActiveLoopError));
            }
            write_nudge(&paths, text.trim())?;
            print_json(&json!({"queued": true}))?;
            Ok(exit_codes::OK)
        }
        Command::Resume => {
            let resumed = resume_loop(&root)?;
            print_json(&json!({"resumed": resumed}))?;
            Ok(exit_codes::OK)
        }
        Command::Memory { command } => cmd_memory(&paths, &store, command),
        Command::Handoff { command } => cmd_handoff(&store, command),
    }
}

fn cmd_run(root: &Path, paths: &LoopPaths, store: &FileMemoryStore) -> Result<i32> {
    let cfg = load_config(&paths.config_path)?;
    let agent = CommandAgent::new(cfg.agent.clone());
    let config = CycleConfig::from_config(&cfg);
    let outcome = run_cycle(
        root,
        &agent,
        store,
        &config,
        &mut std::thread::sleep,
        |decision| debug!(action = %decision.to_json()["action"], "boundary processed"),
    )?;
    let stop = match &outcome.stop {
        CycleStop::Terminated { outcome, reason } => json!({
            "stop": "terminated",
            "outcome": outcome,
            "reason": reason,
        }),
        CycleStop::ContextThreshold => json!({"stop": "context_threshold"}),
    };
    print_json(&json!({
        "session_id": outcome.session_id,
        "cycle": outcome.cycle,
        "iterations_run": outcome.iterations_run,
        "final_iteration": outcome.final_iteration,
        "context_pct": outcome.context_pct,
        "result": stop,
    }))?;
    Ok(outcome.exit_code())
}

fn cmd_supervise(root: &Path, paths: &LoopPaths, store: &FileMemoryStore) -> Result<i32> {
    let cfg = load_config(&paths.config_path)?;
    let runner = ProcessCycleRunner::current_exe(&cfg)?;
    let config = SupervisorConfig::from_config(&cfg);
    let outcome = supervise(root, &runner, store, &config, &mut std::thread::sleep)?;
    print_json(&json!({
        "session_id": outcome.session_id,
        "state": outcome.state,
        "cycles_run": outcome.cycles_run,
        "retries": outcome.retries,
        "handoffs": outcome.handoffs,
    }))?;
    Ok(outcome.exit_code())
}

fn cmd_boundary(
    root: &Path,
    paths: &LoopPaths,
    store: &FileMemoryStore,
    transcript: Option<PathBuf>,
) -> Result<i32> {
    let transcript = match transcript {
        Some(path) => path,
        None => {
            let mut payload = String::new();
            std::io::stdin()
                .read_to_string(&mut payload)
                .context("read hook payload from stdin")?;
            PathBuf::from(transcript_path_from_hook(&payload)?)
        }
    };
    let config = BoundaryConfig::from_config(&load_config(&paths.config_path)?);
    let decision = process_boundary(root, &transcript, store, &config, &mut std::thread::sleep)?;
    print_json(&decision.to_json())?;
    Ok(exit_codes::OK)
}

fn cmd_memory(paths: &LoopPaths, store: &FileMemoryStore, command: MemoryCommand) -> Result<i32> {
    match command {
        MemoryCommand::Init => {
            let store = FileMemoryStore::init(&paths.memory_dir)?;
            print_json(&json!({"path": store.path()}))?;
        }
        MemoryCommand::Add {
            category,
            title,
            content,
            tags,
            importance,
            session_id,
        } => {
            let memory = tags.into_iter().fold(
                NewMemory::new(category, session_id, title, content).importance(importance),
                |memory, tag| memory.tag(tag),
            );
            let id = store.store(memory)?;
            print_json(&json!({"id": id}))?;
        }
        MemoryCommand::Search {
            query,
            category,
            tags,
            session_id,
            importance_min,
            limit,
        } => {
            let query = MemoryQuery {
                query,
                tags: tags.into_iter().collect(),
                category,
                importance_min,
                session_id,
                limit: Some(limit),
            };
            let results = store.search(&query)?;
            print_json(&results)?;
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_handoff(store: &FileMemoryStore, command: HandoffCommand) -> Result<i32> {
    let client = MemoryClient::new(store);
    match command {
        HandoffCommand::Save => {
            let mut payload = String::new();
            std::io::stdin()
                .read_to_string(&mut payload)
                .context("read handoff from stdin")?;
            let handoff: CycleHandoff =
                serde_json::from_str(&payload).context("parse handoff json")?;
            client.require_available()?;
            let id = save_handoff(&client, &handoff)
                .ok_or_else(|| anyhow!("handoff for session {} was not saved", handoff.session_id))?;
            print_json(&json!({"saved": true, "id": id}))?;
        }
        HandoffCommand::Load { session_id } => {
            print_json(&load_handoff(&client, &session_id))?;
        }
    }
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered: Value = serde_json::to_value(value).context("serialize output")?;
    println!("{rendered}");
    Ok(())
}
