//! Run position: where a run is, what it must return to, and how often each
//! station has been attempted.
//!
//! The position is never persisted as authoritative state; it is reconstructed
//! from the ledger by [`crate::core::routing::replay`]. Resume stacks are
//! explicit data (spec'd detours and flow injections), not language-level
//! recursion, so a crashed run rebuilds exactly.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::graph::{FlowGraph, StationAddr};

/// A pending return position pushed by DETOUR or INJECT_FLOW.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeFrame {
    /// DETOUR: when `target` completes, control returns to `resume`.
    Station {
        target: StationAddr,
        resume: StationAddr,
    },
    /// INJECT_FLOW: when flow `flow` runs to closure, control returns to
    /// `resume` instead of advancing to the flow after it.
    Flow { flow: String, resume: StationAddr },
}

/// Where control lands once the injected-station queue drains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InjectionResume {
    /// Re-run the station at `addr` (it asked for remediation via RERUN or
    /// FIX_ENV and must re-validate).
    At { addr: StationAddr },
    /// Treat the station at `addr` as completed and advance past it.
    AdvanceFrom { addr: StationAddr },
}

/// The next unit of work for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StationTarget {
    /// A station of the static graph.
    Graph { addr: StationAddr },
    /// An ephemeral remediation station, executed in the context of `flow`.
    Remediation { name: String, flow: String },
}

/// Mutable routing state of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPosition {
    pub current: StationAddr,
    /// Resume stack, innermost last.
    pub frames: Vec<ResumeFrame>,
    /// Ephemeral remediation stations awaiting execution, front first.
    pub injected: VecDeque<String>,
    /// Where control resumes after the injected queue drains.
    pub resume_after_injection: Option<InjectionResume>,
    /// Attempt counter per `<flow>/<station>` key. Strictly increases per
    /// agent invocation; never reset within a run.
    pub attempts: BTreeMap<String, u32>,
    pub flows_started: BTreeSet<String>,
}

impl RunPosition {
    /// Position at the entry of the graph.
    pub fn start(graph: &FlowGraph) -> Option<Self> {
        let current = graph.entry()?;
        let mut flows_started = BTreeSet::new();
        flows_started.insert(current.flow.clone());
        Some(Self {
            current,
            frames: Vec::new(),
            injected: VecDeque::new(),
            resume_after_injection: None,
            attempts: BTreeMap::new(),
            flows_started,
        })
    }

    /// The next unit of work: the injected queue front, else the current
    /// graph station.
    pub fn pending(&self) -> StationTarget {
        match self.injected.front() {
            Some(name) => StationTarget::Remediation {
                name: name.clone(),
                flow: self.current.flow.clone(),
            },
            None => StationTarget::Graph {
                addr: self.current.clone(),
            },
        }
    }

    /// Move to a new graph station, tracking flow entry.
    pub fn set_current(&mut self, addr: StationAddr) {
        self.flows_started.insert(addr.flow.clone());
        self.current = addr;
    }

    /// Attempts recorded so far for the pending unit of work.
    pub fn attempts_for(&self, key: &str) -> u32 {
        self.attempts.get(key).copied().unwrap_or(0)
    }

    /// Record one more attempt; returns the new count.
    pub fn record_attempt(&mut self, key: &str) -> u32 {
        let counter = self.attempts.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Attempt key for the pending unit of work.
    pub fn pending_key(&self) -> String {
        match self.pending() {
            StationTarget::Graph { addr } => addr.key(),
            StationTarget::Remediation { name, flow } => format!("{flow}/{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::default_graph;

    #[test]
    fn start_position_is_graph_entry_with_flow_started() {
        let graph = default_graph();
        let position = RunPosition::start(&graph).expect("start");
        assert_eq!(
            position.current,
            StationAddr::new("signal", "requirements-author")
        );
        assert!(position.flows_started.contains("signal"));
        assert_eq!(
            position.pending(),
            StationTarget::Graph {
                addr: StationAddr::new("signal", "requirements-author")
            }
        );
    }

    #[test]
    fn injected_queue_takes_precedence_over_current() {
        let graph = default_graph();
        let mut position = RunPosition::start(&graph).expect("start");
        position.injected.push_back("env-fixer".to_string());
        assert_eq!(
            position.pending(),
            StationTarget::Remediation {
                name: "env-fixer".to_string(),
                flow: "signal".to_string()
            }
        );
        assert_eq!(position.pending_key(), "signal/env-fixer");
    }

    #[test]
    fn attempt_counter_strictly_increases() {
        let graph = default_graph();
        let mut position = RunPosition::start(&graph).expect("start");
        let key = position.pending_key();
        assert_eq!(position.attempts_for(&key), 0);
        assert_eq!(position.record_attempt(&key), 1);
        assert_eq!(position.record_attempt(&key), 2);
        assert_eq!(position.attempts_for(&key), 2);
    }
}
