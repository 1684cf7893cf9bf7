//! Pure, deterministic orchestration logic.
//!
//! No module under `core` touches the filesystem or spawns processes; that
//! separation keeps routing, lane computation, and status parsing fully
//! testable in isolation and lets the ledger replay reproduce any run state.

pub mod graph;
pub mod lane;
pub mod position;
pub mod routing;
pub mod status_block;
pub mod types;
