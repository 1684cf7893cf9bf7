//! Content-addressed-by-path artifact storage under `.runs/<run-id>/`.
//!
//! Every path is relative to the run artifact root. Normalization rejects
//! absolute paths, `..` traversal, and `.runs` re-entry before any scope
//! check runs; cross-run isolation is absolute and does not depend on
//! declared allowlists. Writes are atomic (temp file + rename) so readers
//! never observe a half-written artifact, and each successful write appends
//! a ledger fragment before returning.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::warn;

use crate::core::lane::LaneScope;
use crate::io::ledger::{Ledger, LedgerRecord, now_rfc3339};

/// Typed artifact-store failures, downcast at the orchestrator boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("artifact not found: {path}")]
    NotFound { path: String },
    #[error("path '{path}' escapes the run artifact root")]
    PathEscape { path: String },
    #[error("station '{station}' may not write '{path}' (allowed: {allowed})")]
    ScopeViolation {
        station: String,
        path: String,
        allowed: String,
    },
}

/// Read/write access to one run's artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    run_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        match normalize(path) {
            Ok(rel) => self.run_dir.join(rel).is_file(),
            Err(_) => false,
        }
    }

    /// Read an artifact. Fails with [`StoreError::NotFound`] when absent.
    pub fn read(&self, path: &str) -> Result<String> {
        let rel = normalize(path)?;
        let full = self.run_dir.join(&rel);
        if !full.is_file() {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            }
            .into());
        }
        fs::read_to_string(&full).with_context(|| format!("read artifact {}", full.display()))
    }

    /// Write an artifact through lane enforcement.
    ///
    /// Last write wins per path; re-runs overwrite, they do not duplicate.
    pub fn write(
        &self,
        scope: &LaneScope,
        path: &str,
        content: &[u8],
        ledger: &Ledger,
    ) -> Result<()> {
        let rel = normalize(path)?;
        self.check_scope(scope, path)?;

        let full = self.run_dir.join(&rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create artifact dir {}", parent.display()))?;
        }
        let file_name = full
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = full.with_file_name(format!(".{file_name}.tmp"));
        fs::write(&tmp, content)
            .with_context(|| format!("write temp artifact {}", tmp.display()))?;
        fs::rename(&tmp, &full)
            .with_context(|| format!("replace artifact {}", full.display()))?;

        ledger.append(&LedgerRecord::ArtifactWrite {
            station: scope.station.clone(),
            path: path.to_string(),
            bytes: content.len() as u64,
            timestamp: now_rfc3339(),
        })?;
        Ok(())
    }

    /// Replay everything under `staging_dir` through scoped writes.
    ///
    /// All staged paths are validated against the scope before anything is
    /// persisted, so one out-of-scope file rejects the whole batch with no
    /// partial state. Returns the written paths in deterministic order.
    pub fn collect_staged(
        &self,
        scope: &LaneScope,
        staging_dir: &Path,
        ledger: &Ledger,
    ) -> Result<Vec<String>> {
        let mut staged = Vec::new();
        if staging_dir.is_dir() {
            walk_staged(staging_dir, staging_dir, &mut staged)?;
        }
        staged.sort();

        for (rel, _) in &staged {
            normalize(rel)?;
            self.check_scope(scope, rel)?;
        }
        let mut written = Vec::new();
        for (rel, full) in &staged {
            let content =
                fs::read(full).with_context(|| format!("read staged file {}", full.display()))?;
            self.write(scope, rel, &content, ledger)?;
            written.push(rel.clone());
        }
        Ok(written)
    }

    fn check_scope(&self, scope: &LaneScope, path: &str) -> Result<()> {
        if scope.permits_write(path) {
            return Ok(());
        }
        Err(StoreError::ScopeViolation {
            station: scope.station.clone(),
            path: path.to_string(),
            allowed: scope.write_patterns().join(", "),
        }
        .into())
    }
}

/// Validate and normalize a run-root-relative path.
///
/// Rejected shapes surface as [`StoreError::PathEscape`]; `.runs` re-entry is
/// additionally logged as a security concern because it targets another run.
fn normalize(path: &str) -> Result<PathBuf, StoreError> {
    let escape = || StoreError::PathEscape {
        path: path.to_string(),
    };
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(escape());
    }
    let mut out = PathBuf::new();
    for (idx, segment) in path.split('/').enumerate() {
        match segment {
            "" | "." | ".." => return Err(escape()),
            ".runs" if idx == 0 => {
                warn!(path, "write attempted to re-enter .runs; cross-run isolation violation");
                return Err(escape());
            }
            ".staging" if idx == 0 => return Err(escape()),
            "ledger.jsonl" if idx == 0 => return Err(escape()),
            segment => out.push(segment),
        }
    }
    Ok(out)
}

fn walk_staged(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<()> {
    for entry in
        fs::read_dir(dir).with_context(|| format!("read staging dir {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("read staging entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            walk_staged(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .with_context(|| format!("staged path outside staging root {}", path.display()))?;
            out.push((rel.to_string_lossy().replace('\\', "/"), path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::{StationAddr, default_graph};
    use crate::core::lane::scope_for;

    fn scope(flow: &str, station: &str) -> LaneScope {
        let graph = default_graph();
        let station = graph
            .station(&StationAddr::new(flow, station))
            .expect("station");
        scope_for(&graph, station).expect("scope")
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        let ledger = Ledger::new(temp.path().join("ledger.jsonl"));
        let scope = scope("signal", "requirements-author");

        store
            .write(&scope, "signal/requirements.md", b"# Requirements\n", &ledger)
            .expect("write");
        let contents = store.read("signal/requirements.md").expect("read");
        assert_eq!(contents, "# Requirements\n");
    }

    #[test]
    fn read_missing_fails_with_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        let err = store.read("signal/absent.md").unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::NotFound {
                path: "signal/absent.md".to_string()
            })
        );
    }

    #[test]
    fn out_of_scope_write_is_rejected_before_persisting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        let ledger = Ledger::new(temp.path().join("ledger.jsonl"));
        let scope = scope("signal", "requirements-author");

        let err = store
            .write(&scope, "plan/contracts.md", b"nope", &ledger)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ScopeViolation { .. })
        ));
        assert!(!temp.path().join("plan/contracts.md").exists());
        assert!(ledger.load().expect("load").is_empty());
    }

    #[test]
    fn traversal_and_cross_run_paths_escape() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        let ledger = Ledger::new(temp.path().join("ledger.jsonl"));
        let scope = scope("signal", "requirements-author");

        for path in [
            "../other/file.md",
            "signal/../../file.md",
            "/etc/passwd",
            ".runs/run-other/plan/x.md",
        ] {
            let err = store.write(&scope, path, b"x", &ledger).unwrap_err();
            assert_eq!(
                err.downcast_ref::<StoreError>(),
                Some(&StoreError::PathEscape {
                    path: path.to_string()
                }),
                "path {path} should escape"
            );
        }
    }

    #[test]
    fn rewrites_overwrite_instead_of_duplicating() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        let ledger = Ledger::new(temp.path().join("ledger.jsonl"));
        let scope = scope("signal", "requirements-author");

        store
            .write(&scope, "signal/requirements.md", b"v1", &ledger)
            .expect("write v1");
        store
            .write(&scope, "signal/requirements.md", b"v2", &ledger)
            .expect("write v2");

        assert_eq!(store.read("signal/requirements.md").expect("read"), "v2");
        // Both writes are in the ledger; the artifact exists once.
        assert_eq!(ledger.load().expect("load").len(), 2);
    }

    #[test]
    fn shared_whitelist_allows_cross_flow_register() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        let ledger = Ledger::new(temp.path().join("ledger.jsonl"));
        let scope = scope("plan", "contract-critic");

        store
            .write(&scope, "open_questions.md", b"- q1\n", &ledger)
            .expect("write whitelist");
        assert!(store.exists("open_questions.md"));
    }

    #[test]
    fn staged_batch_with_one_violation_persists_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = temp.path().join("run");
        fs::create_dir_all(&run_dir).expect("run dir");
        let store = ArtifactStore::new(&run_dir);
        let ledger = Ledger::new(run_dir.join("ledger.jsonl"));
        let scope = scope("signal", "bdd-author");

        let staging = temp.path().join("staging");
        fs::create_dir_all(staging.join("signal")).expect("staging dirs");
        fs::create_dir_all(staging.join("plan")).expect("staging dirs");
        fs::write(staging.join("signal/features.md"), "ok").expect("stage ok");
        fs::write(staging.join("plan/contracts.md"), "out of lane").expect("stage bad");

        let err = store
            .collect_staged(&scope, &staging, &ledger)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ScopeViolation { .. })
        ));
        assert!(!run_dir.join("signal/features.md").exists());
        assert!(!run_dir.join("plan/contracts.md").exists());
    }

    #[test]
    fn staged_batch_collects_in_deterministic_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = temp.path().join("run");
        fs::create_dir_all(&run_dir).expect("run dir");
        let store = ArtifactStore::new(&run_dir);
        let ledger = Ledger::new(run_dir.join("ledger.jsonl"));
        let scope = scope("signal", "bdd-author");

        let staging = temp.path().join("staging");
        fs::create_dir_all(staging.join("signal")).expect("staging dirs");
        fs::write(staging.join("signal/features.md"), "features").expect("stage");
        fs::write(staging.join("signal/answers.md"), "answers").expect("stage");

        let written = store
            .collect_staged(&scope, &staging, &ledger)
            .expect("collect");
        assert_eq!(
            written,
            vec![
                "signal/answers.md".to_string(),
                "signal/features.md".to_string()
            ]
        );
        assert!(store.exists("signal/features.md"));
    }
}
