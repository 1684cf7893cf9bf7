//! Scaffolding for the `.runs/` layout and per-run directories.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::graph::FlowGraph;
use crate::io::config::{OrchestratorConfig, write_config};
use crate::io::graph_store::write_graph;

/// Canonical project-level paths.
#[derive(Debug, Clone)]
pub struct RunsPaths {
    pub root: PathBuf,
    pub runs_dir: PathBuf,
    pub index_path: PathBuf,
    pub config_path: PathBuf,
    pub graph_path: PathBuf,
    pub prompts_dir: PathBuf,
}

impl RunsPaths {
    pub fn new(root: impl Into<PathBuf>, prompts_dir: &str) -> Self {
        let root = root.into();
        let runs_dir = root.join(".runs");
        Self {
            index_path: runs_dir.join("index.json"),
            config_path: runs_dir.join("config.toml"),
            graph_path: runs_dir.join("graph.json"),
            prompts_dir: root.join(prompts_dir),
            root,
            runs_dir,
        }
    }

    pub fn run(&self, run_id: &str) -> RunPaths {
        RunPaths::new(&self.runs_dir, run_id)
    }
}

/// Canonical paths within one run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub meta_path: PathBuf,
    pub ledger_path: PathBuf,
    pub staging_dir: PathBuf,
}

impl RunPaths {
    pub fn new(runs_dir: &Path, run_id: &str) -> Self {
        let run_dir = runs_dir.join(run_id);
        Self {
            meta_path: run_dir.join("run_meta.json"),
            ledger_path: run_dir.join("ledger.jsonl"),
            staging_dir: run_dir.join(".staging"),
            run_dir,
        }
    }

    /// Staging directory for one station attempt.
    pub fn attempt_staging(&self, station: &str, attempt: u32) -> PathBuf {
        self.staging_dir.join(station).join(attempt.to_string())
    }

    /// Invocation log path for one station attempt.
    pub fn attempt_log(&self, station: &str, attempt: u32) -> PathBuf {
        self.staging_dir
            .join(station)
            .join(format!("{attempt}.invocation.log"))
    }
}

/// Options for [`init_layout`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing orchestrator-owned files.
    pub force: bool,
}

/// Create the `.runs/` scaffolding plus placeholder station prompts.
///
/// Fails if `.runs/` already exists unless `options.force` is set.
pub fn init_layout(root: &Path, graph: &FlowGraph, options: &InitOptions) -> Result<RunsPaths> {
    let config = OrchestratorConfig::default();
    let paths = RunsPaths::new(root, &config.prompts_dir);
    if paths.runs_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: .runs already exists (use --force to overwrite)"
        ));
    }
    if paths.runs_dir.exists() && !paths.runs_dir.is_dir() {
        return Err(anyhow!("init: .runs exists but is not a directory"));
    }

    fs::create_dir_all(&paths.runs_dir)
        .with_context(|| format!("create directory {}", paths.runs_dir.display()))?;
    write_config(&paths.config_path, &config)?;
    write_graph(&paths.graph_path, graph)?;
    if options.force || !paths.index_path.exists() {
        fs::write(&paths.index_path, "{\n  \"runs\": []\n}\n")
            .with_context(|| format!("write {}", paths.index_path.display()))?;
    }
    write_prompt_placeholders(&paths.prompts_dir, graph, options.force)?;

    Ok(paths)
}

/// Create the per-run directory tree: flow directories, staging, empty ledger.
pub fn scaffold_run(paths: &RunsPaths, run_id: &str, graph: &FlowGraph) -> Result<RunPaths> {
    let run = paths.run(run_id);
    if run.run_dir.exists() {
        return Err(anyhow!(
            "run directory {} already exists",
            run.run_dir.display()
        ));
    }
    fs::create_dir_all(&run.run_dir)
        .with_context(|| format!("create directory {}", run.run_dir.display()))?;
    for flow in &graph.flows {
        let flow_dir = run.run_dir.join(&flow.name);
        fs::create_dir_all(&flow_dir)
            .with_context(|| format!("create directory {}", flow_dir.display()))?;
    }
    fs::create_dir_all(&run.staging_dir)
        .with_context(|| format!("create directory {}", run.staging_dir.display()))?;
    fs::write(&run.ledger_path, "")
        .with_context(|| format!("write {}", run.ledger_path.display()))?;
    Ok(run)
}

/// Write a placeholder prompt file per station so a fresh project is runnable
/// before the real prompt prose is authored.
fn write_prompt_placeholders(prompts_dir: &Path, graph: &FlowGraph, force: bool) -> Result<()> {
    fs::create_dir_all(prompts_dir)
        .with_context(|| format!("create directory {}", prompts_dir.display()))?;
    let stations = graph
        .flows
        .iter()
        .flat_map(|flow| &flow.stations)
        .chain(&graph.remediations);
    for station in stations {
        let path = prompts_dir.join(&station.prompt);
        if path.exists() && !force {
            continue;
        }
        let contents = format!(
            "# {name}\n\nDescribe the work this station performs.\n",
            name = station.name
        );
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::default_graph;
    use crate::io::config::load_config;
    use crate::io::graph_store::load_graph;
    use crate::io::index::load_index;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let graph = default_graph();

        let paths = init_layout(temp.path(), &graph, &InitOptions { force: false }).expect("init");

        assert!(paths.runs_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert!(paths.graph_path.is_file());
        assert!(paths.index_path.is_file());
        assert!(paths.prompts_dir.is_dir());
        assert!(paths.prompts_dir.join("requirements-author.md").is_file());
        assert!(paths.prompts_dir.join("env-fixer.md").is_file());

        assert_eq!(load_config(&paths.config_path).expect("config").max_attempts, 3);
        assert_eq!(load_graph(&paths.graph_path).expect("graph"), graph);
        assert!(load_index(&paths.index_path).expect("index").runs.is_empty());
    }

    #[test]
    fn init_without_force_refuses_existing_runs_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let graph = default_graph();
        init_layout(temp.path(), &graph, &InitOptions { force: false }).expect("init");
        let err = init_layout(temp.path(), &graph, &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn scaffold_run_creates_flow_dirs_and_ledger() {
        let temp = tempfile::tempdir().expect("tempdir");
        let graph = default_graph();
        let paths = init_layout(temp.path(), &graph, &InitOptions { force: false }).expect("init");

        let run = scaffold_run(&paths, "run-1", &graph).expect("scaffold");
        for flow in ["signal", "plan", "build", "gate", "deploy", "wisdom"] {
            assert!(run.run_dir.join(flow).is_dir(), "missing flow dir {flow}");
        }
        assert!(run.staging_dir.is_dir());
        assert!(run.ledger_path.is_file());

        let err = scaffold_run(&paths, "run-1", &graph).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn attempt_paths_are_stable() {
        let run = RunPaths::new(Path::new("/tmp/.runs"), "run-1");
        assert!(
            run.attempt_staging("builder", 2)
                .ends_with(Path::new(".staging/builder/2"))
        );
        assert!(
            run.attempt_log("builder", 2)
                .ends_with(Path::new(".staging/builder/2.invocation.log"))
        );
    }
}
