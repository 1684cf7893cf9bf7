//! Run metadata cache at `.runs/<run-id>/run_meta.json`.
//!
//! A derived snapshot of the current position for tooling; the ledger stays
//! authoritative for resume.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::RunStatus;

/// Persisted run snapshot (`run_meta.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunMeta {
    pub run_id: String,
    pub status: RunStatus,
    pub current_flow: String,
    pub current_station: String,
    /// Flow names entered so far, sorted for stable serialization.
    pub flows_started: Vec<String>,
}

/// Load run meta from disk.
pub fn load_run_meta(path: &Path) -> Result<RunMeta> {
    debug!(path = %path.display(), "loading run meta");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run meta {}", path.display()))?;
    let meta: RunMeta = serde_json::from_str(&contents)
        .with_context(|| format!("parse run meta {}", path.display()))?;
    Ok(meta)
}

/// Atomically write run meta to disk (temp file + rename).
pub fn write_run_meta(path: &Path, meta: &RunMeta) -> Result<()> {
    debug!(path = %path.display(), run_id = %meta.run_id, status = ?meta.status, "writing run meta");
    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("run meta path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp run meta {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run meta {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_meta_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_meta.json");
        let meta = RunMeta {
            run_id: "run-20260101_000000-abc123".to_string(),
            status: RunStatus::Active,
            current_flow: "signal".to_string(),
            current_station: "bdd-author".to_string(),
            flows_started: vec!["signal".to_string()],
        };
        write_run_meta(&path, &meta).expect("write");
        let loaded = load_run_meta(&path).expect("load");
        assert_eq!(loaded, meta);
    }

    #[test]
    fn run_meta_serialization_is_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_meta.json");
        let meta = RunMeta {
            run_id: "run-1".to_string(),
            status: RunStatus::Blocked,
            current_flow: "gate".to_string(),
            current_station: "secrets-gate".to_string(),
            flows_started: vec![
                "build".to_string(),
                "gate".to_string(),
                "plan".to_string(),
                "signal".to_string(),
            ],
        };
        write_run_meta(&path, &meta).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        let expected = "{\n  \"run_id\": \"run-1\",\n  \"status\": \"BLOCKED\",\n  \"current_flow\": \"gate\",\n  \"current_station\": \"secrets-gate\",\n  \"flows_started\": [\n    \"build\",\n    \"gate\",\n    \"plan\",\n    \"signal\"\n  ]\n}\n";
        assert_eq!(contents, expected);
    }
}
