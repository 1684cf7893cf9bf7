//! Pipeline run orchestrator CLI.
//!
//! Drives delivery-pipeline runs under `.runs/`: each run walks the flow
//! graph station by station, with lane-scoped artifact writes, a structured
//! status block per station, and an append-only ledger that makes every run
//! resumable.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use conductor::abort::abort_run;
use conductor::core::graph::default_graph;
use conductor::core::position::StationTarget;
use conductor::core::routing::RoutingOutcome;
use conductor::core::types::RunStatus;
use conductor::exit_codes;
use conductor::io::agent::ProcessAgentInvoker;
use conductor::io::config::load_config;
use conductor::io::index::load_index;
use conductor::io::init::{InitOptions, init_layout};
use conductor::looping::{LoopStop, run_to_completion};
use conductor::report::{render_report, run_report};
use conductor::start::start_run;
use conductor::step::run_station_step;
use conductor::validate::validate_project;

#[derive(Parser)]
#[command(name = "conductor", version, about = "Pipeline run orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the `.runs/` layout, default config, graph, and prompts.
    Init {
        /// Overwrite existing orchestrator-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run at the graph entry station.
    Start,
    /// Execute one station step of a run.
    Step {
        /// Run id; defaults to the most recent active run.
        #[arg(long)]
        run: Option<String>,
    },
    /// Step a run until it completes or halts.
    Loop {
        /// Run id; defaults to the most recent active run.
        #[arg(long)]
        run: Option<String>,
    },
    /// Print the ledger-derived run summary.
    Status {
        /// Run id; defaults to the most recent active run.
        #[arg(long)]
        run: Option<String>,
    },
    /// Abort a run, keeping all artifacts for inspection.
    Abort {
        /// Run id; defaults to the most recent active run.
        #[arg(long)]
        run: Option<String>,
        /// Reason recorded in the ledger.
        #[arg(long)]
        reason: Option<String>,
    },
    /// Check the flow graph against its schema and invariants.
    Validate,
}

fn main() -> ExitCode {
    conductor::logging::init();
    match run() {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::INVALID as u8)
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Start => cmd_start(&root),
        Command::Step { run } => cmd_step(&root, run),
        Command::Loop { run } => cmd_loop(&root, run),
        Command::Status { run } => cmd_status(&root, run),
        Command::Abort { run, reason } => cmd_abort(&root, run, reason),
        Command::Validate => cmd_validate(&root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    init_layout(root, &default_graph(), &InitOptions { force })?;
    println!("initialized .runs layout");
    Ok(exit_codes::OK)
}

fn cmd_start(root: &Path) -> Result<i32> {
    let outcome = start_run(root)?;
    println!("{}", outcome.run_id);
    Ok(exit_codes::OK)
}

fn cmd_step(root: &Path, run: Option<String>) -> Result<i32> {
    let run_id = resolve_run(root, run)?;
    let invoker = process_invoker(root)?;
    let step = run_station_step(root, &invoker, &run_id)?;
    print_step(&step);
    Ok(match step.outcome {
        RoutingOutcome::Advance { .. } => exit_codes::OK,
        RoutingOutcome::Complete => exit_codes::COMPLETE,
        RoutingOutcome::Halt { .. } => exit_codes::BLOCKED,
    })
}

fn cmd_loop(root: &Path, run: Option<String>) -> Result<i32> {
    let run_id = resolve_run(root, run)?;
    let invoker = process_invoker(root)?;
    let outcome = run_to_completion(root, &invoker, &run_id, print_step)?;
    match &outcome.stop {
        LoopStop::Complete => {
            println!("run {} completed in {} steps", outcome.run_id, outcome.steps_executed);
            Ok(exit_codes::COMPLETE)
        }
        LoopStop::Halted { reason } => {
            println!("run {} halted: {}", outcome.run_id, reason.label());
            Ok(exit_codes::BLOCKED)
        }
        LoopStop::AttemptLimitExceeded {
            station_key,
            attempts,
            max_attempts,
        } => {
            println!(
                "run {} halted: station {station_key} exhausted attempts ({attempts}/{max_attempts})",
                outcome.run_id
            );
            Ok(exit_codes::BLOCKED)
        }
    }
}

fn cmd_status(root: &Path, run: Option<String>) -> Result<i32> {
    let run_id = resolve_run(root, run)?;
    let report = run_report(root, &run_id)?;
    print!("{}", render_report(&report));
    Ok(match report.status {
        RunStatus::Blocked => exit_codes::BLOCKED,
        RunStatus::Completed => exit_codes::COMPLETE,
        RunStatus::Active => exit_codes::OK,
    })
}

fn cmd_abort(root: &Path, run: Option<String>, reason: Option<String>) -> Result<i32> {
    let run_id = resolve_run(root, run)?;
    abort_run(root, &run_id, reason.as_deref())?;
    println!("aborted {run_id}");
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let graph = validate_project(root)?;
    println!(
        "graph ok: {} flows, {} stations",
        graph.flows.len(),
        graph
            .flows
            .iter()
            .map(|flow| flow.stations.len())
            .sum::<usize>()
    );
    Ok(exit_codes::OK)
}

fn process_invoker(root: &Path) -> Result<ProcessAgentInvoker> {
    let config = load_config(&root.join(".runs").join("config.toml"))?;
    Ok(ProcessAgentInvoker::new(config.agent.command))
}

fn resolve_run(root: &Path, run: Option<String>) -> Result<String> {
    if let Some(run_id) = run {
        return Ok(run_id);
    }
    let index = load_index(&root.join(".runs").join("index.json"))?;
    index
        .latest_with_status(RunStatus::Active)
        .map(|entry| entry.run_id.clone())
        .ok_or_else(|| anyhow!("no active run; pass --run or start one with `conductor start`"))
}

fn print_step(step: &conductor::step::StepOutcome) {
    let status = step
        .status
        .map(|status| status.to_string())
        .unwrap_or_else(|| "-".to_string());
    let outcome = match &step.outcome {
        RoutingOutcome::Advance { to } => match to {
            StationTarget::Graph { addr } => format!("advance to {}", addr.key()),
            StationTarget::Remediation { name, flow } => {
                format!("advance to {flow}/{name} (remediation)")
            }
        },
        RoutingOutcome::Complete => "complete".to_string(),
        RoutingOutcome::Halt { reason } => format!("halt: {}", reason.label()),
    };
    println!(
        "[{}] {} attempt {} status={} -> {}",
        step.run_id, step.station_key, step.attempt, status, outcome
    );
}
