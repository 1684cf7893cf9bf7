//! `conductor validate`: check the graph document before any run depends on
//! it.

use std::path::Path;

use anyhow::Result;

use crate::core::graph::FlowGraph;
use crate::io::config::load_config;
use crate::io::graph_store::load_graph;
use crate::io::init::RunsPaths;

/// Validate `.runs/graph.json` (schema + invariants) and the config.
///
/// Returns the parsed graph on success; all violations are listed in the
/// error.
pub fn validate_project(root: &Path) -> Result<FlowGraph> {
    let config = load_config(&root.join(".runs").join("config.toml"))?;
    let paths = RunsPaths::new(root, &config.prompts_dir);
    load_graph(&paths.graph_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::default_graph;
    use crate::io::init::{InitOptions, init_layout};
    use std::fs;

    #[test]
    fn validates_initialized_project() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_layout(temp.path(), &default_graph(), &InitOptions { force: false }).expect("init");
        let graph = validate_project(temp.path()).expect("validate");
        assert_eq!(graph, default_graph());
    }

    #[test]
    fn reports_schema_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_layout(temp.path(), &default_graph(), &InitOptions { force: false }).expect("init");
        fs::write(
            temp.path().join(".runs/graph.json"),
            r#"{"flows": []}"#,
        )
        .expect("write bad graph");

        let err = validate_project(temp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }
}
