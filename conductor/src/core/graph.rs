//! Declarative flow graph: ordered flows of stations plus a remediation
//! registry reachable only through `INJECT_NODES`/`EXTEND_GRAPH`.
//!
//! The graph is immutable once defined. Routing never mutates it; ephemeral
//! remediation stations live on the run position, not here.

use serde::{Deserialize, Serialize};

use crate::core::lane::glob_match;
use crate::core::types::StationClass;

/// Address of a station within the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationAddr {
    pub flow: String,
    pub station: String,
}

impl StationAddr {
    pub fn new(flow: impl Into<String>, station: impl Into<String>) -> Self {
        Self {
            flow: flow.into(),
            station: station.into(),
        }
    }

    /// Stable key for attempt counters (`<flow>/<station>`).
    pub fn key(&self) -> String {
        format!("{}/{}", self.flow, self.station)
    }
}

/// One declared station input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Path relative to the run artifact root.
    pub path: String,
    /// Required inputs block invocation when absent; best-effort inputs are
    /// supplied when present and silently omitted otherwise.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

fn default_class() -> StationClass {
    StationClass::Work
}

/// One agent invocation point. Immutable once the graph is defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub name: String,
    #[serde(default = "default_class")]
    pub class: StationClass,
    /// Prompt file name, resolved against the configured prompts directory.
    pub prompt: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Write globs relative to the run artifact root.
    pub allowed_write_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
}

/// A named phase containing an ordered list of stations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    pub stations: Vec<Station>,
}

/// The full static graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub flows: Vec<Flow>,
    /// Stations reachable only via `INJECT_NODES`/`EXTEND_GRAPH`.
    #[serde(default)]
    pub remediations: Vec<Station>,
    /// Cross-flow write whitelist shared by every station.
    #[serde(default)]
    pub shared_write_paths: Vec<String>,
}

impl FlowGraph {
    pub fn flow(&self, name: &str) -> Option<&Flow> {
        self.flows.iter().find(|flow| flow.name == name)
    }

    pub fn station(&self, addr: &StationAddr) -> Option<&Station> {
        self.flow(&addr.flow)?
            .stations
            .iter()
            .find(|station| station.name == addr.station)
    }

    pub fn remediation(&self, name: &str) -> Option<&Station> {
        self.remediations
            .iter()
            .find(|station| station.name == name)
    }

    /// First station of the first flow.
    pub fn entry(&self) -> Option<StationAddr> {
        let flow = self.flows.first()?;
        let station = flow.stations.first()?;
        Some(StationAddr::new(&flow.name, &station.name))
    }

    /// First station of a named flow.
    pub fn flow_entry(&self, name: &str) -> Option<StationAddr> {
        let flow = self.flow(name)?;
        let station = flow.stations.first()?;
        Some(StationAddr::new(&flow.name, &station.name))
    }

    /// The station after `addr` within the same flow, if any.
    pub fn next_in_flow(&self, addr: &StationAddr) -> Option<StationAddr> {
        let flow = self.flow(&addr.flow)?;
        let idx = flow
            .stations
            .iter()
            .position(|station| station.name == addr.station)?;
        let next = flow.stations.get(idx + 1)?;
        Some(StationAddr::new(&flow.name, &next.name))
    }

    /// The flow after the named flow in declared order, if any.
    pub fn next_flow(&self, name: &str) -> Option<&Flow> {
        let idx = self.flows.iter().position(|flow| flow.name == name)?;
        self.flows.get(idx + 1)
    }

    /// Whether `addr` is the last station of the last flow.
    pub fn is_final(&self, addr: &StationAddr) -> bool {
        self.next_in_flow(addr).is_none()
            && self
                .flows
                .last()
                .is_some_and(|flow| flow.name == addr.flow)
    }

    /// The first station (in flow order) whose write globs cover `path`.
    ///
    /// This is the static fallback route for a missing required input.
    pub fn producer_of(&self, path: &str) -> Option<StationAddr> {
        for flow in &self.flows {
            for station in &flow.stations {
                if station
                    .allowed_write_paths
                    .iter()
                    .any(|pattern| glob_match(pattern, path))
                {
                    return Some(StationAddr::new(&flow.name, &station.name));
                }
            }
        }
        None
    }
}

/// The built-in delivery pipeline graph.
pub fn default_graph() -> FlowGraph {
    let work = |name: &str, inputs: Vec<InputSpec>, writes: &[&str]| Station {
        name: name.to_string(),
        class: StationClass::Work,
        prompt: format!("{name}.md"),
        inputs,
        allowed_write_paths: writes.iter().map(|glob| (*glob).to_string()).collect(),
        model_hint: None,
    };
    let required = |path: &str| InputSpec {
        path: path.to_string(),
        required: true,
    };
    let best_effort = |path: &str| InputSpec {
        path: path.to_string(),
        required: false,
    };

    FlowGraph {
        flows: vec![
            Flow {
                name: "signal".to_string(),
                stations: vec![
                    work("requirements-author", Vec::new(), &["signal/**"]),
                    work(
                        "bdd-author",
                        vec![required("signal/requirements.md")],
                        &["signal/**"],
                    ),
                ],
            },
            Flow {
                name: "plan".to_string(),
                stations: vec![
                    work(
                        "interface-designer",
                        vec![
                            required("signal/requirements.md"),
                            best_effort("signal/features.md"),
                        ],
                        &["plan/**"],
                    ),
                    work(
                        "contract-critic",
                        vec![required("plan/contracts.md")],
                        &["plan/**"],
                    ),
                ],
            },
            Flow {
                name: "build".to_string(),
                stations: vec![
                    work(
                        "builder",
                        vec![
                            required("plan/contracts.md"),
                            best_effort("plan/design.md"),
                        ],
                        &["build/**"],
                    ),
                    work(
                        "receipt-checker",
                        vec![required("build/receipt.md")],
                        &["build/**"],
                    ),
                ],
            },
            Flow {
                name: "gate".to_string(),
                stations: vec![Station {
                    name: "secrets-gate".to_string(),
                    class: StationClass::Gate,
                    prompt: "secrets-gate.md".to_string(),
                    inputs: vec![best_effort("build/receipt.md")],
                    allowed_write_paths: vec!["gate/**".to_string()],
                    model_hint: None,
                }],
            },
            Flow {
                name: "deploy".to_string(),
                stations: vec![work(
                    "publisher",
                    vec![
                        required("build/receipt.md"),
                        best_effort("gate/scan_report.md"),
                    ],
                    &["deploy/**"],
                )],
            },
            Flow {
                name: "wisdom".to_string(),
                stations: vec![work(
                    "retrospective-writer",
                    vec![best_effort("deploy/release_notes.md")],
                    &["wisdom/**"],
                )],
            },
        ],
        remediations: vec![work("env-fixer", Vec::new(), &["env/**"])],
        shared_write_paths: vec!["open_questions.md".to_string()],
    }
}

/// Validate graph invariants.
///
/// Returns a list of stable error messages (empty on success).
pub fn validate_invariants(graph: &FlowGraph) -> Vec<String> {
    let mut errors = Vec::new();

    if graph.flows.is_empty() {
        errors.push("graph must declare at least one flow".to_string());
    }

    let mut flow_names = std::collections::BTreeSet::new();
    for flow in &graph.flows {
        if !flow_names.insert(flow.name.clone()) {
            errors.push(format!("duplicate flow name '{}'", flow.name));
        }
        if flow.stations.is_empty() {
            errors.push(format!("flow '{}' has no stations", flow.name));
        }
    }

    let mut station_names = std::collections::BTreeSet::new();
    let all_stations = graph
        .flows
        .iter()
        .flat_map(|flow| &flow.stations)
        .chain(&graph.remediations);
    for station in all_stations {
        if !station_names.insert(station.name.clone()) {
            errors.push(format!("duplicate station name '{}'", station.name));
        }
        if station.allowed_write_paths.is_empty() {
            errors.push(format!(
                "station '{}' declares no allowed_write_paths",
                station.name
            ));
        }
        for pattern in &station.allowed_write_paths {
            if pattern.starts_with('/') || pattern.split('/').any(|seg| seg == "..") {
                errors.push(format!(
                    "station '{}' write pattern '{}' escapes the run root",
                    station.name, pattern
                ));
            }
        }
        for input in &station.inputs {
            if input.path.starts_with('/') || input.path.split('/').any(|seg| seg == "..") {
                errors.push(format!(
                    "station '{}' input '{}' escapes the run root",
                    station.name, input.path
                ));
            }
        }
    }

    for station in graph.flows.iter().flat_map(|flow| &flow.stations) {
        for input in &station.inputs {
            if input.required && graph.producer_of(&input.path).is_none() {
                errors.push(format!(
                    "station '{}' requires '{}' but no station produces it",
                    station.name, input.path
                ));
            }
        }
    }

    errors
}
