//! Orchestration for starting a new run.
//!
//! A run is one pipeline execution identified by a stable, opaque `run_id`.
//! Starting a run scaffolds `.runs/<run-id>/` (flow directories, staging,
//! empty ledger), writes the initial `run_meta.json`, and registers the run in
//! the global index. Artifacts live only under the run directory, so any
//! number of runs may proceed in parallel.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info};

use crate::core::position::RunPosition;
use crate::core::types::RunStatus;
use crate::io::config::load_config;
use crate::io::graph_store::load_graph;
use crate::io::index::{IndexEntry, append_run};
use crate::io::init::{RunsPaths, scaffold_run};
use crate::io::ledger::{Ledger, LedgerRecord, now_rfc3339};
use crate::io::run_meta::{RunMeta, write_run_meta};

const RUN_ID_ALLOCATION_ATTEMPTS: u32 = 16;

/// Outcome of `conductor start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub run_id: String,
}

/// Start a new run in `root`.
pub fn start_run(root: &Path) -> Result<StartOutcome> {
    let config = load_config(&root.join(".runs").join("config.toml"))?;
    let paths = RunsPaths::new(root, &config.prompts_dir);
    if !paths.runs_dir.is_dir() {
        return Err(anyhow!("missing .runs layout (run `conductor init` first)"));
    }
    let graph = load_graph(&paths.graph_path)?;
    let position = RunPosition::start(&graph)
        .ok_or_else(|| anyhow!("flow graph has no entry station"))?;

    let run_id = allocate_run_id(&paths)?;
    let run = scaffold_run(&paths, &run_id, &graph)
        .with_context(|| format!("scaffold run {run_id}"))?;

    let ledger = Ledger::new(&run.ledger_path);
    ledger.append(&LedgerRecord::RunStarted {
        run_id: run_id.clone(),
        timestamp: now_rfc3339(),
    })?;

    write_run_meta(
        &run.meta_path,
        &RunMeta {
            run_id: run_id.clone(),
            status: RunStatus::Active,
            current_flow: position.current.flow.clone(),
            current_station: position.current.station.clone(),
            flows_started: position.flows_started.iter().cloned().collect(),
        },
    )?;

    append_run(
        &paths.index_path,
        IndexEntry {
            run_id: run_id.clone(),
            status: RunStatus::Active,
            created_at: now_rfc3339(),
        },
    )?;

    info!(run_id = %run_id, "run started");
    Ok(StartOutcome { run_id })
}

/// Generate a unique run id (`run-<UTC timestamp>-<6 random alphanumerics>`).
fn allocate_run_id(paths: &RunsPaths) -> Result<String> {
    for _ in 0..RUN_ID_ALLOCATION_ATTEMPTS {
        let run_id = generate_run_id();
        if !paths.run(&run_id).run_dir.exists() {
            debug!(run_id = %run_id, "allocated run id");
            return Ok(run_id);
        }
    }
    Err(anyhow!(
        "failed to allocate a unique run id after {RUN_ID_ALLOCATION_ATTEMPTS} attempts"
    ))
}

fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("run-{timestamp}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::default_graph;
    use crate::io::index::load_index;
    use crate::io::init::{InitOptions, init_layout};
    use crate::io::run_meta::load_run_meta;

    #[test]
    fn start_scaffolds_run_and_registers_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_layout(temp.path(), &default_graph(), &InitOptions { force: false }).expect("init");

        let outcome = start_run(temp.path()).expect("start");
        assert!(outcome.run_id.starts_with("run-"));

        let run_dir = temp.path().join(".runs").join(&outcome.run_id);
        assert!(run_dir.join("signal").is_dir());
        assert!(run_dir.join("ledger.jsonl").is_file());

        let meta = load_run_meta(&run_dir.join("run_meta.json")).expect("meta");
        assert_eq!(meta.status, RunStatus::Active);
        assert_eq!(meta.current_flow, "signal");
        assert_eq!(meta.current_station, "requirements-author");

        let index = load_index(&temp.path().join(".runs/index.json")).expect("index");
        assert_eq!(index.runs.len(), 1);
        assert_eq!(index.runs[0].run_id, outcome.run_id);
    }

    #[test]
    fn start_without_init_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = start_run(temp.path()).unwrap_err();
        assert!(err.to_string().contains("conductor init"));
    }

    #[test]
    fn parallel_runs_are_isolated() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_layout(temp.path(), &default_graph(), &InitOptions { force: false }).expect("init");

        let first = start_run(temp.path()).expect("start first");
        let second = start_run(temp.path()).expect("start second");
        assert_ne!(first.run_id, second.run_id);

        let index = load_index(&temp.path().join(".runs/index.json")).expect("index");
        assert_eq!(index.runs.len(), 2);
    }
}
