//! Flow-graph document IO: schema-checked loading of `.runs/graph.json`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::graph::{FlowGraph, default_graph, validate_invariants};

const GRAPH_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/flow_graph.schema.json"
));

/// Load the flow graph.
///
/// A missing file yields the built-in default graph; a present file must pass
/// both JSON Schema validation and the semantic invariants.
pub fn load_graph(path: &Path) -> Result<FlowGraph> {
    if !path.exists() {
        return Ok(default_graph());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_graph(&raw).with_context(|| format!("load graph {}", path.display()))
}

/// Parse and validate a graph document: schema conformance + invariants.
pub fn parse_graph(raw: &str) -> Result<FlowGraph> {
    let instance: Value = serde_json::from_str(raw).context("parse graph json")?;
    validate_schema(&instance)?;
    let graph: FlowGraph = serde_json::from_str(raw).context("parse graph document")?;
    let errors = validate_invariants(&graph);
    if !errors.is_empty() {
        bail!("graph invariant violations:\n- {}", errors.join("\n- "));
    }
    Ok(graph)
}

/// Write a graph document with pretty JSON and trailing newline.
pub fn write_graph(path: &Path, graph: &FlowGraph) -> Result<()> {
    let errors = validate_invariants(graph);
    if !errors.is_empty() {
        bail!("graph invariant violations:\n- {}", errors.join("\n- "));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(graph).context("serialize graph")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

/// Validate a graph JSON instance against the embedded schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(GRAPH_SCHEMA).context("parse graph schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile graph schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("graph schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_default_graph() {
        let temp = tempfile::tempdir().expect("tempdir");
        let graph = load_graph(&temp.path().join("graph.json")).expect("load");
        assert_eq!(graph, default_graph());
    }

    #[test]
    fn default_graph_round_trips_through_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("graph.json");
        write_graph(&path, &default_graph()).expect("write");
        let loaded = load_graph(&path).expect("load");
        assert_eq!(loaded, default_graph());
    }

    #[test]
    fn schema_rejects_station_without_write_paths() {
        let raw = r#"{
            "flows": [
                {
                    "name": "signal",
                    "stations": [
                        {"name": "author", "prompt": "author.md", "allowed_write_paths": []}
                    ]
                }
            ]
        }"#;
        let err = parse_graph(raw).unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn invariants_reject_unproducible_required_input() {
        let raw = r#"{
            "flows": [
                {
                    "name": "signal",
                    "stations": [
                        {
                            "name": "author",
                            "prompt": "author.md",
                            "inputs": [{"path": "elsewhere/input.md"}],
                            "allowed_write_paths": ["signal/**"]
                        }
                    ]
                }
            ]
        }"#;
        let err = parse_graph(raw).unwrap_err();
        assert!(err.to_string().contains("no station produces it"));
    }
}
