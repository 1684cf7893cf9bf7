//! Append-only run ledger at `.runs/<run-id>/ledger.jsonl`.
//!
//! One JSON record per line. The ledger is the sole source of truth for
//! resuming a run: replaying the station visits in order reconstructs the run
//! position, resume stacks and attempt counters included. Records are never
//! rewritten; re-runs append new attempts and the full history stays
//! inspectable.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::routing::RoutingOutcome;
use crate::core::types::StatusRecord;

/// One station invocation, as recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationVisit {
    /// `<flow>/<station>` of the invoked station.
    pub station_key: String,
    /// Attempt counter value after this invocation. Unchanged from the prior
    /// visit when the invocation did not consume an attempt (mechanical
    /// failures, missing-input synthesis).
    pub attempt: u32,
    pub inputs_read: Vec<String>,
    pub outputs_written: Vec<String>,
    pub record: StatusRecord,
    pub outcome: RoutingOutcome,
    /// Operator-facing prose from outside the status block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<String>,
    pub timestamp: String,
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerRecord {
    RunStarted {
        run_id: String,
        timestamp: String,
    },
    StationVisit(Box<StationVisit>),
    /// Fragment appended by the artifact store before a write returns.
    ArtifactWrite {
        station: String,
        path: String,
        bytes: u64,
        timestamp: String,
    },
    RunCompleted {
        timestamp: String,
    },
    RunHalted {
        reason: String,
        timestamp: String,
    },
    RunAborted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: String,
    },
}

/// Handle to one run's ledger file.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a JSON line.
    pub fn append(&self, record: &LedgerRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record).context("serialize ledger record")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append ledger {}", self.path.display()))?;
        Ok(())
    }

    /// Load all records in order. A missing file is an empty ledger.
    pub fn load(&self) -> Result<Vec<LedgerRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read ledger {}", self.path.display()))?;
        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: LedgerRecord = serde_json::from_str(line)
                .with_context(|| format!("parse ledger line {} of {}", idx + 1, self.path.display()))?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Current UTC time as RFC 3339.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::position::StationTarget;
    use crate::core::graph::StationAddr;
    use crate::core::types::StatusRecord;

    fn sample_visit() -> StationVisit {
        StationVisit {
            station_key: "signal/requirements-author".to_string(),
            attempt: 1,
            inputs_read: Vec::new(),
            outputs_written: vec!["signal/requirements.md".to_string()],
            record: StatusRecord::cannot_proceed(vec!["example".to_string()]),
            outcome: RoutingOutcome::Advance {
                to: StationTarget::Graph {
                    addr: StationAddr::new("signal", "bdd-author"),
                },
            },
            handoff: Some("handoff prose".to_string()),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn missing_ledger_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(temp.path().join("ledger.jsonl"));
        assert_eq!(ledger.load().expect("load"), Vec::new());
    }

    #[test]
    fn append_then_load_preserves_order_and_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(temp.path().join("ledger.jsonl"));

        let started = LedgerRecord::RunStarted {
            run_id: "run-1".to_string(),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
        };
        let visit = LedgerRecord::StationVisit(Box::new(sample_visit()));
        ledger.append(&started).expect("append started");
        ledger.append(&visit).expect("append visit");

        let records = ledger.load().expect("load");
        assert_eq!(records, vec![started, visit]);
    }

    #[test]
    fn append_never_rewrites_existing_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(temp.path().join("ledger.jsonl"));
        ledger
            .append(&LedgerRecord::RunStarted {
                run_id: "run-1".to_string(),
                timestamp: "t0".to_string(),
            })
            .expect("append");
        let before = fs::read_to_string(ledger.path()).expect("read");

        ledger
            .append(&LedgerRecord::RunCompleted {
                timestamp: "t1".to_string(),
            })
            .expect("append");
        let after = fs::read_to_string(ledger.path()).expect("read");
        assert!(after.starts_with(&before));
        assert_eq!(after.lines().count(), 2);
    }
}
