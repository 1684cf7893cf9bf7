//! The routing state machine: applies a normalized status record to a run
//! position and decides what runs next.
//!
//! All transitions are pure. The ledger stores each station's record; replaying
//! those records through [`apply_routing`] reconstructs the exact position of
//! an interrupted run, resume stacks included.

use serde::{Deserialize, Serialize};

use crate::core::graph::{FlowGraph, StationAddr};
use crate::core::position::{InjectionResume, ResumeFrame, RunPosition, StationTarget};
use crate::core::types::{
    RecommendedAction, RoutingDirective, RoutingTarget, StationClass, Status, StatusRecord,
};

/// Why a run halted for human attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    /// CANNOT_PROCEED with no usable routing.
    CannotProceed,
    /// Environment must be fixed before the run can resume.
    Environment,
    /// The gate refused commit/publish.
    GateBlocked,
    /// A routing target that does not exist in the graph. Never guessed.
    UnknownTarget { target: String },
}

impl HaltReason {
    /// Stable operator-facing label, used in the ledger and CLI output.
    pub fn label(&self) -> String {
        match self {
            HaltReason::CannotProceed => "cannot proceed; human review required".to_string(),
            HaltReason::Environment => "fix environment then resume".to_string(),
            HaltReason::GateBlocked => "gate refused commit/publish".to_string(),
            HaltReason::UnknownTarget { target } => {
                format!("unknown routing target '{target}'")
            }
        }
    }
}

/// The orchestrator's decision after one station invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingOutcome {
    Advance { to: StationTarget },
    Complete,
    Halt { reason: HaltReason },
}

/// Apply one station record to the position.
///
/// On `Advance`/`Complete` the position is mutated; on `Halt` it is left
/// untouched so the run can resume at the same station once unblocked.
pub fn apply_routing(
    graph: &FlowGraph,
    position: &mut RunPosition,
    record: &StatusRecord,
) -> RoutingOutcome {
    if position.injected.front().is_some() {
        return route_remediation(graph, position, record);
    }
    match record.status.class() {
        StationClass::Gate => route_gate(graph, position, record),
        StationClass::Work => route_work(graph, position, record),
    }
}

fn route_gate(
    graph: &FlowGraph,
    position: &mut RunPosition,
    record: &StatusRecord,
) -> RoutingOutcome {
    let passed = matches!(record.status, Status::Clean | Status::Fixed)
        && record.safe_to_commit == Some(true)
        && record.safe_to_publish == Some(true);
    if passed {
        advance_continue(graph, position)
    } else {
        RoutingOutcome::Halt {
            reason: HaltReason::GateBlocked,
        }
    }
}

fn route_work(
    graph: &FlowGraph,
    position: &mut RunPosition,
    record: &StatusRecord,
) -> RoutingOutcome {
    match record.routing_directive {
        Some(RoutingDirective::Continue) => advance_continue(graph, position),
        Some(RoutingDirective::Detour) => route_detour(graph, position, record),
        Some(RoutingDirective::InjectFlow) => route_inject_flow(graph, position, record),
        Some(RoutingDirective::InjectNodes) | Some(RoutingDirective::ExtendGraph) => {
            route_inject_nodes(graph, position, record)
        }
        Some(RoutingDirective::Bounce) => route_bounce(graph, position, record),
        None => route_undirected(graph, position, record),
    }
}

/// No directive: PROCEED advances, RERUN repeats, everything else halts.
fn route_undirected(
    graph: &FlowGraph,
    position: &mut RunPosition,
    record: &StatusRecord,
) -> RoutingOutcome {
    if record.recommended_action == RecommendedAction::FixEnv {
        return RoutingOutcome::Halt {
            reason: HaltReason::Environment,
        };
    }
    // RERUN stays routable even for CANNOT_PROCEED: bounded re-invocation is
    // how transient generation failures recover, and the attempt counter
    // still caps the loop.
    if record.recommended_action == RecommendedAction::Rerun {
        return RoutingOutcome::Advance {
            to: StationTarget::Graph {
                addr: position.current.clone(),
            },
        };
    }
    if record.status == Status::CannotProceed {
        return RoutingOutcome::Halt {
            reason: HaltReason::CannotProceed,
        };
    }
    match record.recommended_action {
        RecommendedAction::Proceed => advance_continue(graph, position),
        _ => RoutingOutcome::Halt {
            reason: HaltReason::CannotProceed,
        },
    }
}

fn route_detour(
    graph: &FlowGraph,
    position: &mut RunPosition,
    record: &StatusRecord,
) -> RoutingOutcome {
    let target = match &record.routing_target {
        Some(RoutingTarget::Station { station }) => {
            StationAddr::new(&position.current.flow, station)
        }
        Some(RoutingTarget::FlowStation { flow, station }) if *flow == position.current.flow => {
            StationAddr::new(flow, station)
        }
        other => return unknown_target(other),
    };
    if graph.station(&target).is_none() {
        return RoutingOutcome::Halt {
            reason: HaltReason::UnknownTarget {
                target: target.key(),
            },
        };
    }
    position.frames.push(ResumeFrame::Station {
        target: target.clone(),
        resume: position.current.clone(),
    });
    position.set_current(target.clone());
    RoutingOutcome::Advance {
        to: StationTarget::Graph { addr: target },
    }
}

fn route_inject_flow(
    graph: &FlowGraph,
    position: &mut RunPosition,
    record: &StatusRecord,
) -> RoutingOutcome {
    let flow = match &record.routing_target {
        Some(RoutingTarget::Flow { flow }) => flow.clone(),
        other => return unknown_target(other),
    };
    let Some(entry) = graph.flow_entry(&flow) else {
        return RoutingOutcome::Halt {
            reason: HaltReason::UnknownTarget { target: flow },
        };
    };
    position.frames.push(ResumeFrame::Flow {
        flow,
        resume: position.current.clone(),
    });
    position.set_current(entry.clone());
    RoutingOutcome::Advance {
        to: StationTarget::Graph { addr: entry },
    }
}

fn route_inject_nodes(
    graph: &FlowGraph,
    position: &mut RunPosition,
    record: &StatusRecord,
) -> RoutingOutcome {
    let name = match &record.routing_target {
        Some(RoutingTarget::Station { station }) => station.clone(),
        other => return unknown_target(other),
    };
    if graph.remediation(&name).is_none() {
        return RoutingOutcome::Halt {
            reason: HaltReason::UnknownTarget { target: name },
        };
    }
    position.injected.push_back(name.clone());
    if position.resume_after_injection.is_none() {
        let addr = position.current.clone();
        position.resume_after_injection = Some(match record.recommended_action {
            RecommendedAction::Rerun | RecommendedAction::FixEnv => InjectionResume::At { addr },
            _ => InjectionResume::AdvanceFrom { addr },
        });
    }
    RoutingOutcome::Advance {
        to: StationTarget::Remediation {
            name,
            flow: position.current.flow.clone(),
        },
    }
}

fn route_bounce(
    graph: &FlowGraph,
    position: &mut RunPosition,
    record: &StatusRecord,
) -> RoutingOutcome {
    let target = match &record.routing_target {
        Some(RoutingTarget::Flow { flow }) => match graph.flow_entry(flow) {
            Some(entry) => entry,
            None => {
                return RoutingOutcome::Halt {
                    reason: HaltReason::UnknownTarget {
                        target: flow.clone(),
                    },
                };
            }
        },
        Some(RoutingTarget::FlowStation { flow, station }) => StationAddr::new(flow, station),
        Some(RoutingTarget::Station { station }) => {
            StationAddr::new(&position.current.flow, station)
        }
        other => return unknown_target(other),
    };
    if graph.station(&target).is_none() {
        return RoutingOutcome::Halt {
            reason: HaltReason::UnknownTarget {
                target: target.key(),
            },
        };
    }
    // A bounce restarts from the target and discards return positions; the
    // attempt counters survive so loop safety still applies.
    position.frames.clear();
    position.injected.clear();
    position.resume_after_injection = None;
    position.set_current(target.clone());
    RoutingOutcome::Advance {
        to: StationTarget::Graph { addr: target },
    }
}

fn route_remediation(
    graph: &FlowGraph,
    position: &mut RunPosition,
    record: &StatusRecord,
) -> RoutingOutcome {
    let succeeded =
        record.status == Status::Verified && record.recommended_action == RecommendedAction::Proceed;
    if !succeeded {
        if record.recommended_action == RecommendedAction::Rerun {
            return RoutingOutcome::Advance {
                to: position.pending(),
            };
        }
        let reason = if record.recommended_action == RecommendedAction::FixEnv {
            HaltReason::Environment
        } else {
            HaltReason::CannotProceed
        };
        return RoutingOutcome::Halt { reason };
    }

    position.injected.pop_front();
    if position.injected.front().is_some() {
        return RoutingOutcome::Advance {
            to: position.pending(),
        };
    }
    match position.resume_after_injection.take() {
        Some(InjectionResume::At { addr }) => {
            position.set_current(addr.clone());
            RoutingOutcome::Advance {
                to: StationTarget::Graph { addr },
            }
        }
        Some(InjectionResume::AdvanceFrom { addr }) => {
            position.set_current(addr);
            advance_continue(graph, position)
        }
        None => RoutingOutcome::Advance {
            to: position.pending(),
        },
    }
}

/// CONTINUE semantics: pop a satisfied detour frame, else the next station in
/// the flow, else pop a satisfied flow frame, else the next flow, else done.
fn advance_continue(graph: &FlowGraph, position: &mut RunPosition) -> RoutingOutcome {
    let completing = position.current.clone();

    if let Some(ResumeFrame::Station { target, resume }) = position.frames.last()
        && *target == completing
    {
        let resume = resume.clone();
        position.frames.pop();
        position.set_current(resume.clone());
        return RoutingOutcome::Advance {
            to: StationTarget::Graph { addr: resume },
        };
    }

    if let Some(next) = graph.next_in_flow(&completing) {
        position.set_current(next.clone());
        return RoutingOutcome::Advance {
            to: StationTarget::Graph { addr: next },
        };
    }

    if let Some(ResumeFrame::Flow { flow, resume }) = position.frames.last()
        && *flow == completing.flow
    {
        let resume = resume.clone();
        position.frames.pop();
        position.set_current(resume.clone());
        return RoutingOutcome::Advance {
            to: StationTarget::Graph { addr: resume },
        };
    }

    match graph.next_flow(&completing.flow) {
        Some(flow) => match flow.stations.first() {
            Some(station) => {
                let next = StationAddr::new(&flow.name, &station.name);
                position.set_current(next.clone());
                RoutingOutcome::Advance {
                    to: StationTarget::Graph { addr: next },
                }
            }
            None => RoutingOutcome::Halt {
                reason: HaltReason::UnknownTarget {
                    target: flow.name.clone(),
                },
            },
        },
        None => RoutingOutcome::Complete,
    }
}

fn unknown_target(target: &Option<RoutingTarget>) -> RoutingOutcome {
    RoutingOutcome::Halt {
        reason: HaltReason::UnknownTarget {
            target: target
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "(none)".to_string()),
        },
    }
}

/// One ledger visit fed back through the state machine on resume.
#[derive(Debug, Clone)]
pub struct ReplayVisit<'a> {
    /// Attempt key (`<flow>/<station>`) of the invoked station.
    pub station_key: String,
    /// Attempt counter value after this invocation.
    pub attempt: u32,
    pub record: &'a StatusRecord,
}

/// Result of replaying a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResult {
    pub position: RunPosition,
    /// Outcome of the last visit, `None` for a fresh run.
    pub last_outcome: Option<RoutingOutcome>,
}

/// Rebuild a run position purely from recorded station visits.
pub fn replay<'a>(
    graph: &FlowGraph,
    visits: impl IntoIterator<Item = ReplayVisit<'a>>,
) -> Option<ReplayResult> {
    let mut position = RunPosition::start(graph)?;
    let mut last_outcome = None;
    for visit in visits {
        let counter = position
            .attempts
            .entry(visit.station_key.clone())
            .or_insert(0);
        *counter = (*counter).max(visit.attempt);
        last_outcome = Some(apply_routing(graph, &mut position, visit.record));
    }
    Some(ReplayResult {
        position,
        last_outcome,
    })
}
