//! Deterministic run orchestrator for agent delivery pipelines.
//!
//! This crate drives one pipeline run through ordered flows of stations
//! (signal, plan, build, gate, deploy, wisdom), sandboxing each station's
//! writes to its lane, parsing the structured status block each agent
//! returns, and routing (continue, detour, flow injection, remediation
//! insertion, bounce) until the run completes or halts for a human. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (graph, routing, lane scopes,
//!   status parsing, ledger replay). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (artifact store, ledger, run
//!   registry, config, agent process execution). Isolated to enable mocking
//!   in tests.
//!
//! Orchestration modules ([`step`], [`start`], [`looping`], [`abort`],
//! [`report`], [`validate`]) coordinate core logic with I/O to implement CLI
//! commands.

pub mod abort;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod report;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
