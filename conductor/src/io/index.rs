//! Global run registry at `.runs/index.json`.
//!
//! Multiple runs may execute in parallel, so the registry is the one piece of
//! shared mutable state. Appends are serialized through an exclusive lockfile
//! with bounded retries; the registry can also be rebuilt from the per-run
//! `run_meta.json` files when it is lost or suspect.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::RunStatus;
use crate::io::run_meta::load_run_meta;

const LOCK_RETRIES: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// One registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at: String,
}

/// The registry document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIndex {
    pub runs: Vec<IndexEntry>,
}

impl RunIndex {
    /// Most recently created run with the given status.
    pub fn latest_with_status(&self, status: RunStatus) -> Option<&IndexEntry> {
        self.runs.iter().rev().find(|entry| entry.status == status)
    }
}

/// Load the registry. A missing file is an empty registry.
pub fn load_index(path: &Path) -> Result<RunIndex> {
    if !path.exists() {
        return Ok(RunIndex::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Register a new run.
pub fn append_run(path: &Path, entry: IndexEntry) -> Result<()> {
    with_index_lock(path, |index| {
        if index.runs.iter().any(|row| row.run_id == entry.run_id) {
            return Err(anyhow!("run '{}' already registered", entry.run_id));
        }
        index.runs.push(entry.clone());
        Ok(())
    })
}

/// Update the status column of a registered run.
pub fn update_run_status(path: &Path, run_id: &str, status: RunStatus) -> Result<()> {
    with_index_lock(path, |index| {
        let row = index
            .runs
            .iter_mut()
            .find(|row| row.run_id == run_id)
            .ok_or_else(|| anyhow!("run '{run_id}' not in index"))?;
        row.status = status;
        Ok(())
    })
}

/// Rebuild the registry by scanning `run_meta.json` files under `runs_dir`.
///
/// Creation order is approximated by run-id sort; ids embed a UTC timestamp.
pub fn rebuild_index(runs_dir: &Path) -> Result<RunIndex> {
    let mut runs = Vec::new();
    if runs_dir.is_dir() {
        for entry in
            fs::read_dir(runs_dir).with_context(|| format!("read {}", runs_dir.display()))?
        {
            let entry = entry.with_context(|| format!("read entry in {}", runs_dir.display()))?;
            let meta_path = entry.path().join("run_meta.json");
            if !meta_path.is_file() {
                continue;
            }
            let meta = load_run_meta(&meta_path)?;
            runs.push(IndexEntry {
                run_id: meta.run_id,
                status: meta.status,
                created_at: String::new(),
            });
        }
    }
    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    Ok(RunIndex { runs })
}

/// Run `mutate` against the registry under the exclusive lockfile.
fn with_index_lock(
    path: &Path,
    mutate: impl FnOnce(&mut RunIndex) -> Result<()>,
) -> Result<()> {
    let lock_path = path.with_extension("json.lock");
    let _guard = IndexLock::acquire(&lock_path)?;

    let mut index = load_index(path)?;
    mutate(&mut index)?;

    let mut buf = serde_json::to_string_pretty(&index)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("index path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp index {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace index {}", path.display()))?;
    Ok(())
}

struct IndexLock {
    path: std::path::PathBuf,
}

impl IndexLock {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        for _ in 0..LOCK_RETRIES {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    debug!(lock = %path.display(), "index lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create index lock {}", path.display()));
                }
            }
        }
        Err(anyhow!(
            "index lock {} held too long; remove it if no run is active",
            path.display()
        ))
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::run_meta::{RunMeta, write_run_meta};

    fn entry(run_id: &str) -> IndexEntry {
        IndexEntry {
            run_id: run_id.to_string(),
            status: RunStatus::Active,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn append_then_load_registers_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("index.json");

        append_run(&path, entry("run-a")).expect("append");
        append_run(&path, entry("run-b")).expect("append");

        let index = load_index(&path).expect("load");
        let ids: Vec<&str> = index.runs.iter().map(|row| row.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-a", "run-b"]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("index.json");
        append_run(&path, entry("run-a")).expect("append");
        let err = append_run(&path, entry("run-a")).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn status_update_changes_only_the_target_row() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("index.json");
        append_run(&path, entry("run-a")).expect("append");
        append_run(&path, entry("run-b")).expect("append");

        update_run_status(&path, "run-a", RunStatus::Completed).expect("update");
        let index = load_index(&path).expect("load");
        assert_eq!(index.runs[0].status, RunStatus::Completed);
        assert_eq!(index.runs[1].status, RunStatus::Active);
    }

    #[test]
    fn lock_is_released_after_append() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("index.json");
        append_run(&path, entry("run-a")).expect("append");
        assert!(!temp.path().join("index.json.lock").exists());
    }

    #[test]
    fn rebuild_scans_run_meta_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runs_dir = temp.path().join(".runs");
        for (run_id, status) in [("run-a", RunStatus::Completed), ("run-b", RunStatus::Active)] {
            write_run_meta(
                &runs_dir.join(run_id).join("run_meta.json"),
                &RunMeta {
                    run_id: run_id.to_string(),
                    status,
                    current_flow: "signal".to_string(),
                    current_station: "requirements-author".to_string(),
                    flows_started: vec!["signal".to_string()],
                },
            )
            .expect("write meta");
        }

        let index = rebuild_index(&runs_dir).expect("rebuild");
        let ids: Vec<&str> = index.runs.iter().map(|row| row.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-a", "run-b"]);
        assert_eq!(index.runs[0].status, RunStatus::Completed);
    }

    #[test]
    fn latest_with_status_prefers_most_recent() {
        let mut index = RunIndex::default();
        index.runs.push(entry("run-a"));
        index.runs.push(entry("run-b"));
        assert_eq!(
            index
                .latest_with_status(RunStatus::Active)
                .map(|row| row.run_id.as_str()),
            Some("run-b")
        );
        assert_eq!(index.latest_with_status(RunStatus::Blocked), None);
    }
}
