//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between core components and the wire
//! format of the station return block. They must not depend on I/O and must
//! remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Station class, which selects the legal status vocabulary.
///
/// Work stations report `VERIFIED`/`UNVERIFIED`/`CANNOT_PROCEED` and may carry
/// routing directives. Gate stations report `CLEAN`/`FIXED`/`BLOCKED` plus the
/// two safety booleans and never route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationClass {
    Work,
    Gate,
}

/// Station-declared outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Verified,
    Unverified,
    CannotProceed,
    Clean,
    Fixed,
    Blocked,
}

impl Status {
    /// The station class this status belongs to.
    pub fn class(self) -> StationClass {
        match self {
            Status::Verified | Status::Unverified | Status::CannotProceed => StationClass::Work,
            Status::Clean | Status::Fixed | Status::Blocked => StationClass::Gate,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Verified => "VERIFIED",
            Status::Unverified => "UNVERIFIED",
            Status::CannotProceed => "CANNOT_PROCEED",
            Status::Clean => "CLEAN",
            Status::Fixed => "FIXED",
            Status::Blocked => "BLOCKED",
        }
    }

    /// Parse a status token. Unknown tokens return `None`; callers fail closed.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "VERIFIED" => Some(Status::Verified),
            "UNVERIFIED" => Some(Status::Unverified),
            "CANNOT_PROCEED" => Some(Status::CannotProceed),
            "CLEAN" => Some(Status::Clean),
            "FIXED" => Some(Status::Fixed),
            "BLOCKED" => Some(Status::Blocked),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Station-recommended next action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedAction {
    Proceed,
    Rerun,
    Bounce,
    FixEnv,
}

impl RecommendedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecommendedAction::Proceed => "PROCEED",
            RecommendedAction::Rerun => "RERUN",
            RecommendedAction::Bounce => "BOUNCE",
            RecommendedAction::FixEnv => "FIX_ENV",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "PROCEED" => Some(RecommendedAction::Proceed),
            "RERUN" => Some(RecommendedAction::Rerun),
            "BOUNCE" => Some(RecommendedAction::Bounce),
            "FIX_ENV" => Some(RecommendedAction::FixEnv),
            _ => None,
        }
    }
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing directive carried in the station return block.
///
/// `null` (no directive) is modeled as `Option<RoutingDirective>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingDirective {
    Continue,
    Detour,
    InjectFlow,
    InjectNodes,
    ExtendGraph,
    Bounce,
}

impl RoutingDirective {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingDirective::Continue => "CONTINUE",
            RoutingDirective::Detour => "DETOUR",
            RoutingDirective::InjectFlow => "INJECT_FLOW",
            RoutingDirective::InjectNodes => "INJECT_NODES",
            RoutingDirective::ExtendGraph => "EXTEND_GRAPH",
            RoutingDirective::Bounce => "BOUNCE",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "CONTINUE" => Some(RoutingDirective::Continue),
            "DETOUR" => Some(RoutingDirective::Detour),
            "INJECT_FLOW" => Some(RoutingDirective::InjectFlow),
            "INJECT_NODES" => Some(RoutingDirective::InjectNodes),
            "EXTEND_GRAPH" => Some(RoutingDirective::ExtendGraph),
            "BOUNCE" => Some(RoutingDirective::Bounce),
            _ => None,
        }
    }
}

impl fmt::Display for RoutingDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured pointer to a flow and/or station.
///
/// Wire grammar is closed: `flow:<name>`, `station:<name>`, or
/// `<flow>/<station>`. Anything else is rejected by the parser; the target is
/// never inferred from context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingTarget {
    /// An entire flow (`flow:signal`).
    Flow { flow: String },
    /// A station within the current flow (`station:requirements-author`).
    Station { station: String },
    /// A fully qualified station (`signal/bdd-author`).
    FlowStation { flow: String, station: String },
}

impl RoutingTarget {
    /// Parse the closed wire grammar. Returns `None` for any other shape.
    pub fn parse(token: &str) -> Option<Self> {
        if let Some(flow) = token.strip_prefix("flow:") {
            return valid_name(flow).then(|| RoutingTarget::Flow {
                flow: flow.to_string(),
            });
        }
        if let Some(station) = token.strip_prefix("station:") {
            return valid_name(station).then(|| RoutingTarget::Station {
                station: station.to_string(),
            });
        }
        let mut parts = token.splitn(2, '/');
        let flow = parts.next()?;
        let station = parts.next()?;
        (valid_name(flow) && valid_name(station)).then(|| RoutingTarget::FlowStation {
            flow: flow.to_string(),
            station: station.to_string(),
        })
    }
}

impl fmt::Display for RoutingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingTarget::Flow { flow } => write!(f, "flow:{flow}"),
            RoutingTarget::Station { station } => write!(f, "station:{station}"),
            RoutingTarget::FlowStation { flow, station } => write!(f, "{flow}/{station}"),
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
}

/// Normalized outcome of one station invocation.
///
/// Created once per invocation, immutable, appended to the run ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: Status,
    pub recommended_action: RecommendedAction,
    pub routing_directive: Option<RoutingDirective>,
    pub routing_target: Option<RoutingTarget>,
    pub blockers: Vec<String>,
    /// Gate-class only: authoritative commit-safety flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_to_commit: Option<bool>,
    /// Gate-class only: authoritative publish-safety flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_to_publish: Option<bool>,
}

impl StatusRecord {
    /// A synthesized record for outcomes the orchestrator decides itself
    /// (scope violations, missing inputs, malformed returns).
    pub fn cannot_proceed(blockers: Vec<String>) -> Self {
        Self {
            status: Status::CannotProceed,
            recommended_action: RecommendedAction::FixEnv,
            routing_directive: None,
            routing_target: None,
            blockers,
            safe_to_commit: None,
            safe_to_publish: None,
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Active,
    Completed,
    Blocked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tokens_round_trip() {
        for status in [
            Status::Verified,
            Status::Unverified,
            Status::CannotProceed,
            Status::Clean,
            Status::Fixed,
            Status::Blocked,
        ] {
            assert_eq!(Status::parse(status.as_str()), Some(status));
        }
        assert_eq!(Status::parse("DONE"), None);
    }

    #[test]
    fn status_class_split_matches_station_classes() {
        assert_eq!(Status::Verified.class(), StationClass::Work);
        assert_eq!(Status::CannotProceed.class(), StationClass::Work);
        assert_eq!(Status::Clean.class(), StationClass::Gate);
        assert_eq!(Status::Blocked.class(), StationClass::Gate);
    }

    #[test]
    fn routing_target_parses_closed_grammar() {
        assert_eq!(
            RoutingTarget::parse("flow:signal"),
            Some(RoutingTarget::Flow {
                flow: "signal".to_string()
            })
        );
        assert_eq!(
            RoutingTarget::parse("station:bdd-author"),
            Some(RoutingTarget::Station {
                station: "bdd-author".to_string()
            })
        );
        assert_eq!(
            RoutingTarget::parse("signal/bdd-author"),
            Some(RoutingTarget::FlowStation {
                flow: "signal".to_string(),
                station: "bdd-author".to_string()
            })
        );
    }

    #[test]
    fn routing_target_rejects_open_forms() {
        assert_eq!(RoutingTarget::parse("bdd-author"), None);
        assert_eq!(RoutingTarget::parse("flow:"), None);
        assert_eq!(RoutingTarget::parse("signal/bdd-author/extra"), None);
        assert_eq!(RoutingTarget::parse("Signal/BDD"), None);
    }

    #[test]
    fn routing_target_display_round_trips() {
        for raw in ["flow:signal", "station:bdd-author", "signal/bdd-author"] {
            let target = RoutingTarget::parse(raw).expect("parse target");
            assert_eq!(target.to_string(), raw);
        }
    }
}
