//! Cancelling a run.
//!
//! Aborting never rolls anything back: artifacts written so far stay on disk
//! for inspection, the ledger records the abort, and the run is marked
//! BLOCKED in its meta and the registry.

use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::info;

use crate::core::types::RunStatus;
use crate::io::config::load_config;
use crate::io::index::update_run_status;
use crate::io::init::RunsPaths;
use crate::io::ledger::{Ledger, LedgerRecord, now_rfc3339};
use crate::io::run_meta::{load_run_meta, write_run_meta};

/// Abort an active run.
pub fn abort_run(root: &Path, run_id: &str, reason: Option<&str>) -> Result<()> {
    let config = load_config(&root.join(".runs").join("config.toml"))?;
    let paths = RunsPaths::new(root, &config.prompts_dir);
    let run = paths.run(run_id);
    if !run.run_dir.is_dir() {
        return Err(anyhow!("unknown run '{run_id}'"));
    }

    let ledger = Ledger::new(&run.ledger_path);
    for record in ledger.load()? {
        match record {
            LedgerRecord::RunCompleted { .. } => {
                return Err(anyhow!("run '{run_id}' already completed"));
            }
            LedgerRecord::RunAborted { .. } => {
                return Err(anyhow!("run '{run_id}' already aborted"));
            }
            _ => {}
        }
    }

    ledger.append(&LedgerRecord::RunAborted {
        reason: reason.map(str::to_string),
        timestamp: now_rfc3339(),
    })?;

    let mut meta = load_run_meta(&run.meta_path)?;
    meta.status = RunStatus::Blocked;
    write_run_meta(&run.meta_path, &meta)?;
    update_run_status(&paths.index_path, run_id, RunStatus::Blocked)?;

    info!(run_id, "run aborted");
    Ok(())
}
