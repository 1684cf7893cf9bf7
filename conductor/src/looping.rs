//! Multi-step looping helper for `conductor loop`.

use std::path::Path;

use anyhow::Result;

use crate::core::routing::{HaltReason, RoutingOutcome};
use crate::io::agent::AgentInvoker;
use crate::step::{AttemptLimitExceededError, StepOutcome, run_station_step};

/// Reason why [`run_to_completion`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The final flow's final station completed the run.
    Complete,
    /// Routing halted the run for human attention.
    Halted { reason: HaltReason },
    /// Loop safety: a station exhausted its attempt budget.
    AttemptLimitExceeded {
        station_key: String,
        attempts: u32,
        max_attempts: u32,
    },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub steps_executed: u32,
    pub stop: LoopStop,
}

/// Step the run repeatedly until it completes or halts.
///
/// Stops immediately on any other error (layout, config, ledger corruption).
pub fn run_to_completion<A: AgentInvoker, F: FnMut(&StepOutcome)>(
    root: &Path,
    invoker: &A,
    run_id: &str,
    mut on_step: F,
) -> Result<LoopOutcome> {
    let mut steps_executed = 0u32;
    loop {
        match run_station_step(root, invoker, run_id) {
            Ok(step) => {
                steps_executed += 1;
                on_step(&step);
                match step.outcome {
                    RoutingOutcome::Advance { .. } => {}
                    RoutingOutcome::Complete => {
                        return Ok(LoopOutcome {
                            run_id: run_id.to_string(),
                            steps_executed,
                            stop: LoopStop::Complete,
                        });
                    }
                    RoutingOutcome::Halt { reason } => {
                        return Ok(LoopOutcome {
                            run_id: run_id.to_string(),
                            steps_executed,
                            stop: LoopStop::Halted { reason },
                        });
                    }
                }
            }
            Err(err) => {
                if let Some(limit) = err.downcast_ref::<AttemptLimitExceededError>() {
                    return Ok(LoopOutcome {
                        run_id: run_id.to_string(),
                        steps_executed,
                        stop: LoopStop::AttemptLimitExceeded {
                            station_key: limit.station_key.clone(),
                            attempts: limit.attempts,
                            max_attempts: limit.max_attempts,
                        },
                    });
                }
                return Err(err);
            }
        }
    }
}
