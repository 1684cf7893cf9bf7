//! Terminal run summary assembled purely from the ledger.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Result, anyhow};

use crate::core::types::RunStatus;
use crate::io::config::load_config;
use crate::io::init::RunsPaths;
use crate::io::ledger::{Ledger, LedgerRecord};
use crate::io::run_meta::load_run_meta;

/// Human-facing run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    /// `<flow>/<station>` the run is at (or stopped at).
    pub stopped_at: String,
    /// Attempt counters per station, in stable order.
    pub attempts: BTreeMap<String, u32>,
    /// Every blocker reported during the run, verbatim, in order.
    pub blockers: Vec<String>,
    /// Reason of the most recent halt, if any.
    pub halt_reason: Option<String>,
}

/// Build the report for one run.
pub fn run_report(root: &Path, run_id: &str) -> Result<RunReport> {
    let config = load_config(&root.join(".runs").join("config.toml"))?;
    let paths = RunsPaths::new(root, &config.prompts_dir);
    let run = paths.run(run_id);
    if !run.run_dir.is_dir() {
        return Err(anyhow!("unknown run '{run_id}'"));
    }

    let meta = load_run_meta(&run.meta_path)?;
    let records = Ledger::new(&run.ledger_path).load()?;

    let mut attempts = BTreeMap::new();
    let mut blockers = Vec::new();
    let mut halt_reason = None;
    for record in &records {
        match record {
            LedgerRecord::StationVisit(visit) => {
                let counter = attempts.entry(visit.station_key.clone()).or_insert(0);
                *counter = (*counter).max(visit.attempt);
                blockers.extend(visit.record.blockers.iter().cloned());
            }
            LedgerRecord::RunHalted { reason, .. } => halt_reason = Some(reason.clone()),
            LedgerRecord::RunAborted { reason, .. } => {
                halt_reason = Some(
                    reason
                        .clone()
                        .unwrap_or_else(|| "aborted by operator".to_string()),
                );
            }
            _ => {}
        }
    }

    Ok(RunReport {
        run_id: run_id.to_string(),
        status: meta.status,
        stopped_at: format!("{}/{}", meta.current_flow, meta.current_station),
        attempts,
        blockers,
        halt_reason,
    })
}

/// Render the report for terminal output.
pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("run:        {}\n", report.run_id));
    out.push_str(&format!("status:     {}\n", status_label(report.status)));
    out.push_str(&format!("station:    {}\n", report.stopped_at));
    if let Some(reason) = &report.halt_reason {
        out.push_str(&format!("halted:     {reason}\n"));
    }
    if !report.attempts.is_empty() {
        out.push_str("attempts:\n");
        for (station, count) in &report.attempts {
            out.push_str(&format!("  {station}: {count}\n"));
        }
    }
    if !report.blockers.is_empty() {
        out.push_str("blockers:\n");
        for blocker in &report.blockers {
            out.push_str(&format!("  - {blocker}\n"));
        }
    }
    out
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Active => "ACTIVE",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Blocked => "BLOCKED",
    }
}
