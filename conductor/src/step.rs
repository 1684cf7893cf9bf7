//! Orchestration for a single station step.
//!
//! Per step: rebuild the run position from the ledger, compute the station's
//! lane scope, gather inputs, invoke the agent, parse its return block, replay
//! staged writes through the artifact store, append the ledger entry, and
//! apply routing. Every invocation leaves a ledger line, synthesized outcomes
//! included, so an interrupted run resumes exactly where it stopped.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::graph::{FlowGraph, Station};
use crate::core::lane::scope_for;
use crate::core::position::{RunPosition, StationTarget};
use crate::core::routing::{ReplayVisit, RoutingOutcome, apply_routing, replay};
use crate::core::status_block::{MalformedStatus, parse};
use crate::core::types::{
    RecommendedAction, RoutingDirective, RoutingTarget, RunStatus, Status, StatusRecord,
};
use crate::io::agent::{AgentInvoker, InvokeRequest, MechanicalFailure};
use crate::io::config::{OrchestratorConfig, load_config};
use crate::io::graph_store::load_graph;
use crate::io::index::update_run_status;
use crate::io::init::{RunPaths, RunsPaths};
use crate::io::ledger::{Ledger, LedgerRecord, StationVisit, now_rfc3339};
use crate::io::prompt::{InputArtifact, PromptBuilder, PromptInputs};
use crate::io::run_meta::{RunMeta, write_run_meta};
use crate::io::store::{ArtifactStore, StoreError};

/// Loop-safety breach: the station hit its attempt budget. Always surfaces to
/// a human, never auto-resolved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("station '{station_key}' exhausted its attempt budget ({attempts}/{max_attempts})")]
pub struct AttemptLimitExceededError {
    pub station_key: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Result of a single station step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub run_id: String,
    /// `<flow>/<station>` of the station this step concerned.
    pub station_key: String,
    /// Attempt counter after the step.
    pub attempt: u32,
    /// False when the orchestrator decided without invoking the agent
    /// (missing required input, attempt limit).
    pub invoked: bool,
    /// Station status, when an agent return was parsed.
    pub status: Option<Status>,
    pub outcome: RoutingOutcome,
}

/// Execute one station step of the given run.
pub fn run_station_step<A: AgentInvoker>(
    root: &Path,
    invoker: &A,
    run_id: &str,
) -> Result<StepOutcome> {
    let config = load_config(&root.join(".runs").join("config.toml"))?;
    let paths = RunsPaths::new(root, &config.prompts_dir);
    let run = paths.run(run_id);
    if !run.run_dir.is_dir() {
        return Err(anyhow!("unknown run '{run_id}' (run `conductor start` first)"));
    }
    let graph = load_graph(&paths.graph_path)?;
    let ledger = Ledger::new(&run.ledger_path);

    let records = ledger.load()?;
    ensure_run_open(&records, run_id)?;

    let visits: Vec<&StationVisit> = records
        .iter()
        .filter_map(|record| match record {
            LedgerRecord::StationVisit(visit) => Some(visit.as_ref()),
            _ => None,
        })
        .collect();
    let replayed = replay(
        &graph,
        visits.iter().map(|visit| ReplayVisit {
            station_key: visit.station_key.clone(),
            attempt: visit.attempt,
            record: &visit.record,
        }),
    )
    .ok_or_else(|| anyhow!("flow graph has no entry station"))?;
    if replayed.last_outcome == Some(RoutingOutcome::Complete) {
        return Err(anyhow!("run '{run_id}' already completed"));
    }
    let mut position = replayed.position;

    let pending = position.pending();
    let station = station_def(&graph, &pending)?;
    let key = position.pending_key();
    info!(run_id, station = %key, "stepping station");

    let ctx = StepCtx {
        run_id,
        key: &key,
        config: &config,
        paths: &paths,
        run: &run,
        ledger: &ledger,
    };

    if position.attempts_for(&key) >= config.max_attempts {
        return Err(ctx.halt_attempt_limit(&position));
    }

    let scope = scope_for(&graph, station)?;
    let store = ArtifactStore::new(&run.run_dir);

    // Gather inputs. A missing required input means the station is not
    // invoked at all; the orchestrator routes to the producing station
    // instead (static fallback policy).
    let mut inputs = Vec::new();
    let mut inputs_read = Vec::new();
    let mut missing_inputs = Vec::new();
    for spec in &scope.read_set {
        if store.exists(&spec.path) {
            inputs.push(InputArtifact {
                path: spec.path.clone(),
                content: store.read(&spec.path)?,
            });
            inputs_read.push(spec.path.clone());
        } else if spec.required {
            return ctx.missing_required_input(&graph, &mut position, &spec.path);
        } else {
            missing_inputs.push(spec.path.clone());
        }
    }

    let prompt_inputs = PromptInputs {
        station_name: station.name.clone(),
        flow: position.current.flow.clone(),
        station_prompt: match read_station_prompt(&paths, station) {
            Ok(prompt) => prompt,
            Err(reason) => {
                return ctx.halt_mechanical(&graph, &mut position, &inputs_read, &reason);
            }
        },
        inputs,
        missing_inputs,
        feedback: previous_blockers(&visits, &key),
        questions: store.read("open_questions.md").ok(),
    };
    let pack = PromptBuilder::new(config.prompt_budget_bytes).build(&prompt_inputs)?;

    // Invocation loop: transient generation failures get a bounded number of
    // re-invocations before escalating.
    let mut parse_failures = 0u32;
    let (parsed, attempt, staging) = loop {
        if position.attempts_for(&key) >= config.max_attempts {
            return Err(ctx.halt_attempt_limit(&position));
        }
        let attempt = position.record_attempt(&key);
        let staging = run.attempt_staging(&station.name, attempt);
        fs::create_dir_all(&staging)
            .with_context(|| format!("create staging dir {}", staging.display()))?;

        let request = InvokeRequest {
            workdir: staging.clone(),
            prompt: pack.render(),
            timeout: Duration::from_secs(config.station_timeout_secs),
            output_limit_bytes: config.agent_output_limit_bytes,
            log_path: run.attempt_log(&station.name, attempt),
            model_hint: station.model_hint.clone(),
        };

        let raw = match invoker.invoke(&request) {
            Ok(raw) => raw,
            Err(err) => {
                if err.downcast_ref::<MechanicalFailure>().is_some() {
                    // The agent never produced content; the attempt does not
                    // count against the station's budget.
                    return ctx.halt_mechanical(
                        &graph,
                        &mut position,
                        &inputs_read,
                        &format!("{err:#}"),
                    );
                }
                return Err(err);
            }
        };

        match parse(&raw, station.class) {
            Ok(parsed) => break (parsed, attempt, staging),
            Err(malformed) => {
                warn!(station = %key, error = %malformed, "malformed status block");
                if parse_failures < config.malformed_status_retries {
                    parse_failures += 1;
                    ctx.record_malformed_retry(
                        &graph,
                        &mut position,
                        attempt,
                        &inputs_read,
                        &malformed,
                    )?;
                    continue;
                }
                return ctx.halt_malformed(&graph, &mut position, attempt, &inputs_read, &malformed);
            }
        }
    };

    // Replay staged writes through the artifact store; lane enforcement
    // happens there. Any violation forces CANNOT_PROCEED and is never
    // retried automatically: the allowlist itself would need correction.
    let outputs_written = match store.collect_staged(&scope, &staging, &ledger) {
        Ok(written) => written,
        Err(err) => {
            if err.downcast_ref::<StoreError>().is_some() {
                return ctx.halt_scope_violation(
                    &graph,
                    &mut position,
                    attempt,
                    &inputs_read,
                    &format!("{err:#}"),
                    parsed.handoff.clone(),
                );
            }
            return Err(err);
        }
    };

    let outcome = apply_routing(&graph, &mut position, &parsed.record);
    ctx.append_visit(
        attempt,
        inputs_read,
        outputs_written,
        parsed.record.clone(),
        outcome.clone(),
        parsed.handoff,
    )?;
    ctx.finalize(&position, &outcome)?;

    Ok(StepOutcome {
        run_id: run_id.to_string(),
        station_key: key.clone(),
        attempt,
        invoked: true,
        status: Some(parsed.record.status),
        outcome,
    })
}

/// Shared step context: paths, config, and ledger for one step invocation.
struct StepCtx<'a> {
    run_id: &'a str,
    key: &'a str,
    config: &'a OrchestratorConfig,
    paths: &'a RunsPaths,
    run: &'a RunPaths,
    ledger: &'a Ledger,
}

impl StepCtx<'_> {
    fn append_visit(
        &self,
        attempt: u32,
        inputs_read: Vec<String>,
        outputs_written: Vec<String>,
        record: StatusRecord,
        outcome: RoutingOutcome,
        handoff: Option<String>,
    ) -> Result<()> {
        self.ledger
            .append(&LedgerRecord::StationVisit(Box::new(StationVisit {
                station_key: self.key.to_string(),
                attempt,
                inputs_read,
                outputs_written,
                record,
                outcome,
                handoff,
                timestamp: now_rfc3339(),
            })))
    }

    /// Write run meta and keep the registry row in sync with the outcome.
    fn finalize(&self, position: &RunPosition, outcome: &RoutingOutcome) -> Result<()> {
        let status = match outcome {
            RoutingOutcome::Advance { .. } => RunStatus::Active,
            RoutingOutcome::Complete => RunStatus::Completed,
            RoutingOutcome::Halt { .. } => RunStatus::Blocked,
        };
        match outcome {
            RoutingOutcome::Complete => self.ledger.append(&LedgerRecord::RunCompleted {
                timestamp: now_rfc3339(),
            })?,
            RoutingOutcome::Halt { reason } => self.ledger.append(&LedgerRecord::RunHalted {
                reason: reason.label(),
                timestamp: now_rfc3339(),
            })?,
            RoutingOutcome::Advance { .. } => {}
        }
        self.write_meta_and_index(position, status)
    }

    fn write_meta_and_index(&self, position: &RunPosition, status: RunStatus) -> Result<()> {
        let (current_flow, current_station) = match position.pending() {
            StationTarget::Graph { addr } => (addr.flow, addr.station),
            StationTarget::Remediation { name, flow } => (flow, name),
        };
        write_run_meta(
            &self.run.meta_path,
            &RunMeta {
                run_id: self.run_id.to_string(),
                status,
                current_flow,
                current_station,
                flows_started: position.flows_started.iter().cloned().collect(),
            },
        )?;
        update_run_status(&self.paths.index_path, self.run_id, status)?;
        Ok(())
    }

    /// Missing required input: do not invoke; route to the producer.
    fn missing_required_input(
        &self,
        graph: &FlowGraph,
        position: &mut RunPosition,
        path: &str,
    ) -> Result<StepOutcome> {
        let blocker = format!("required input '{path}' is missing");
        let record = match graph.producer_of(path) {
            Some(producer) => StatusRecord {
                status: Status::CannotProceed,
                recommended_action: RecommendedAction::Bounce,
                routing_directive: Some(RoutingDirective::Bounce),
                routing_target: Some(RoutingTarget::FlowStation {
                    flow: producer.flow,
                    station: producer.station,
                }),
                blockers: vec![blocker],
                safe_to_commit: None,
                safe_to_publish: None,
            },
            None => StatusRecord {
                status: Status::CannotProceed,
                recommended_action: RecommendedAction::Proceed,
                routing_directive: None,
                routing_target: None,
                blockers: vec![blocker],
                safe_to_commit: None,
                safe_to_publish: None,
            },
        };
        let attempt = position.attempts_for(self.key);
        let outcome = apply_routing(graph, position, &record);
        self.append_visit(attempt, Vec::new(), Vec::new(), record, outcome.clone(), None)?;
        self.finalize(position, &outcome)?;
        Ok(StepOutcome {
            run_id: self.run_id.to_string(),
            station_key: self.key.to_string(),
            attempt,
            invoked: false,
            status: None,
            outcome,
        })
    }

    /// Mechanical failure: halt for an environment fix without consuming an
    /// attempt.
    fn halt_mechanical(
        &self,
        graph: &FlowGraph,
        position: &mut RunPosition,
        inputs_read: &[String],
        reason: &str,
    ) -> Result<StepOutcome> {
        let record = StatusRecord::cannot_proceed(vec![reason.to_string()]);
        // The in-memory counter may already include the failed invocation;
        // the persisted attempt stays at what the ledger already holds so
        // retry budgets are not spent on environment problems.
        let attempt = self.persisted_attempts();
        let outcome = apply_routing(graph, position, &record);
        self.append_visit(
            attempt,
            inputs_read.to_vec(),
            Vec::new(),
            record,
            outcome.clone(),
            None,
        )?;
        self.finalize(position, &outcome)?;
        Ok(StepOutcome {
            run_id: self.run_id.to_string(),
            station_key: self.key.to_string(),
            attempt,
            invoked: false,
            status: None,
            outcome,
        })
    }

    /// Attempts already persisted to the ledger for this station.
    fn persisted_attempts(&self) -> u32 {
        let records = match self.ledger.load() {
            Ok(records) => records,
            Err(_) => return 0,
        };
        records
            .iter()
            .filter_map(|record| match record {
                LedgerRecord::StationVisit(visit) if visit.station_key == self.key => {
                    Some(visit.attempt)
                }
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn record_malformed_retry(
        &self,
        graph: &FlowGraph,
        position: &mut RunPosition,
        attempt: u32,
        inputs_read: &[String],
        malformed: &MalformedStatus,
    ) -> Result<()> {
        let record = StatusRecord {
            status: Status::CannotProceed,
            recommended_action: RecommendedAction::Rerun,
            routing_directive: None,
            routing_target: None,
            blockers: vec![format!("malformed status block: {malformed}")],
            safe_to_commit: None,
            safe_to_publish: None,
        };
        let outcome = apply_routing(graph, position, &record);
        self.append_visit(
            attempt,
            inputs_read.to_vec(),
            Vec::new(),
            record,
            outcome,
            None,
        )
    }

    fn halt_malformed(
        &self,
        graph: &FlowGraph,
        position: &mut RunPosition,
        attempt: u32,
        inputs_read: &[String],
        malformed: &MalformedStatus,
    ) -> Result<StepOutcome> {
        let record = StatusRecord {
            status: Status::CannotProceed,
            recommended_action: RecommendedAction::Proceed,
            routing_directive: None,
            routing_target: None,
            blockers: vec![format!("malformed status block: {malformed}")],
            safe_to_commit: None,
            safe_to_publish: None,
        };
        let outcome = apply_routing(graph, position, &record);
        self.append_visit(
            attempt,
            inputs_read.to_vec(),
            Vec::new(),
            record,
            outcome.clone(),
            None,
        )?;
        self.finalize(position, &outcome)?;
        Ok(StepOutcome {
            run_id: self.run_id.to_string(),
            station_key: self.key.to_string(),
            attempt,
            invoked: true,
            status: Some(Status::CannotProceed),
            outcome,
        })
    }

    fn halt_scope_violation(
        &self,
        graph: &FlowGraph,
        position: &mut RunPosition,
        attempt: u32,
        inputs_read: &[String],
        violation: &str,
        handoff: Option<String>,
    ) -> Result<StepOutcome> {
        let record = StatusRecord {
            status: Status::CannotProceed,
            recommended_action: RecommendedAction::Proceed,
            routing_directive: None,
            routing_target: None,
            blockers: vec![violation.to_string()],
            safe_to_commit: None,
            safe_to_publish: None,
        };
        let outcome = apply_routing(graph, position, &record);
        self.append_visit(
            attempt,
            inputs_read.to_vec(),
            Vec::new(),
            record,
            outcome.clone(),
            handoff,
        )?;
        self.finalize(position, &outcome)?;
        Ok(StepOutcome {
            run_id: self.run_id.to_string(),
            station_key: self.key.to_string(),
            attempt,
            invoked: true,
            status: Some(Status::CannotProceed),
            outcome,
        })
    }

    fn halt_attempt_limit(&self, position: &RunPosition) -> anyhow::Error {
        let attempts = position.attempts_for(self.key);
        let error = AttemptLimitExceededError {
            station_key: self.key.to_string(),
            attempts,
            max_attempts: self.config.max_attempts,
        };
        let halt = (|| -> Result<()> {
            self.ledger.append(&LedgerRecord::RunHalted {
                reason: error.to_string(),
                timestamp: now_rfc3339(),
            })?;
            self.write_meta_and_index(position, RunStatus::Blocked)
        })();
        if let Err(err) = halt {
            warn!(error = %err, "failed to persist attempt-limit halt");
        }
        error.into()
    }
}

fn ensure_run_open(records: &[LedgerRecord], run_id: &str) -> Result<()> {
    for record in records {
        match record {
            LedgerRecord::RunCompleted { .. } => {
                return Err(anyhow!("run '{run_id}' already completed"));
            }
            LedgerRecord::RunAborted { .. } => {
                return Err(anyhow!("run '{run_id}' was aborted"));
            }
            _ => {}
        }
    }
    Ok(())
}

fn station_def<'g>(graph: &'g FlowGraph, pending: &StationTarget) -> Result<&'g Station> {
    match pending {
        StationTarget::Graph { addr } => graph
            .station(addr)
            .ok_or_else(|| anyhow!("station '{}' not in graph", addr.key())),
        StationTarget::Remediation { name, .. } => graph
            .remediation(name)
            .ok_or_else(|| anyhow!("remediation station '{name}' not in graph")),
    }
}

fn read_station_prompt(paths: &RunsPaths, station: &Station) -> Result<String, String> {
    let path = paths.prompts_dir.join(&station.prompt);
    fs::read_to_string(&path).map_err(|err| format!("read station prompt {}: {err}", path.display()))
}

/// Blockers from the most recent prior visit of this station, fed back to the
/// agent as context for the retry.
fn previous_blockers(visits: &[&StationVisit], key: &str) -> Option<String> {
    visits
        .iter()
        .rev()
        .find(|visit| visit.station_key == key && !visit.record.blockers.is_empty())
        .map(|visit| visit.record.blockers.join("\n"))
}
