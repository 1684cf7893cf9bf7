//! Lane enforcement: the read/write scope sandbox computed per station.
//!
//! Scopes are computed before a station is invoked. The write set is the
//! station's declared globs plus the graph-wide shared whitelist; the read set
//! is its declared inputs. Enforcement happens at the artifact-store boundary,
//! which consults the precomputed scope.

use regex::Regex;
use thiserror::Error;

use crate::core::graph::{FlowGraph, InputSpec, Station};

#[derive(Debug, Error)]
pub enum LaneError {
    #[error("invalid write pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// A compiled write-allowlist entry.
#[derive(Debug, Clone)]
pub struct WriteRule {
    pub pattern: String,
    regex: Regex,
}

/// The permitted read and write sets for one station invocation.
#[derive(Debug, Clone)]
pub struct LaneScope {
    pub station: String,
    pub read_set: Vec<InputSpec>,
    write_rules: Vec<WriteRule>,
}

impl LaneScope {
    pub fn permits_write(&self, path: &str) -> bool {
        self.write_rules.iter().any(|rule| rule.regex.is_match(path))
    }

    /// Declared patterns, for error messages and the ledger.
    pub fn write_patterns(&self) -> Vec<&str> {
        self.write_rules
            .iter()
            .map(|rule| rule.pattern.as_str())
            .collect()
    }
}

/// Compute the scope for one station against the graph's shared whitelist.
pub fn scope_for(graph: &FlowGraph, station: &Station) -> Result<LaneScope, LaneError> {
    let mut write_rules = Vec::new();
    for pattern in station
        .allowed_write_paths
        .iter()
        .chain(&graph.shared_write_paths)
    {
        write_rules.push(compile_rule(pattern)?);
    }
    Ok(LaneScope {
        station: station.name.clone(),
        read_set: station.inputs.clone(),
        write_rules,
    })
}

/// Match a single glob pattern against a run-root-relative path.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    match compile_rule(pattern) {
        Ok(rule) => rule.regex.is_match(path),
        Err(_) => false,
    }
}

fn compile_rule(pattern: &str) -> Result<WriteRule, LaneError> {
    let regex = Regex::new(&glob_to_regex(pattern)).map_err(|err| LaneError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })?;
    Ok(WriteRule {
        pattern: pattern.to_string(),
        regex,
    })
}

/// Translate a glob (`*`, `**`, `?`) into an anchored regex.
///
/// `*` and `?` never cross `/`; `**` does.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:[^/]+/)*");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            ch if "\\.+()|[]{}^$".contains(ch) => {
                out.push('\\');
                out.push(ch);
            }
            ch => out.push(ch),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::default_graph;

    #[test]
    fn glob_star_stays_within_segment() {
        assert!(glob_match("signal/*.md", "signal/requirements.md"));
        assert!(!glob_match("signal/*.md", "signal/nested/requirements.md"));
    }

    #[test]
    fn glob_double_star_crosses_segments() {
        assert!(glob_match("signal/**", "signal/requirements.md"));
        assert!(glob_match("signal/**", "signal/nested/deep/file.md"));
        assert!(!glob_match("signal/**", "plan/contracts.md"));
        assert!(!glob_match("signal/**", "signal"));
    }

    #[test]
    fn glob_double_star_prefix_matches_any_depth() {
        assert!(glob_match("**/open_questions.md", "open_questions.md"));
        assert!(glob_match("**/open_questions.md", "plan/open_questions.md"));
        assert!(!glob_match("**/open_questions.md", "plan/questions.md"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        assert!(glob_match("signal/file.md", "signal/file.md"));
        assert!(!glob_match("signal/file.md", "signal/fileXmd"));
    }

    #[test]
    fn scope_includes_station_globs_and_shared_whitelist() {
        let graph = default_graph();
        let station = graph
            .station(&crate::core::graph::StationAddr::new("signal", "bdd-author"))
            .expect("station");
        let scope = scope_for(&graph, station).expect("scope");

        assert!(scope.permits_write("signal/features.md"));
        assert!(scope.permits_write("open_questions.md"));
        assert!(!scope.permits_write("plan/contracts.md"));
        assert!(!scope.permits_write("run_meta.json"));
    }

    #[test]
    fn scope_read_set_is_declared_inputs() {
        let graph = default_graph();
        let station = graph
            .station(&crate::core::graph::StationAddr::new("signal", "bdd-author"))
            .expect("station");
        let scope = scope_for(&graph, station).expect("scope");

        assert_eq!(scope.read_set.len(), 1);
        assert_eq!(scope.read_set[0].path, "signal/requirements.md");
        assert!(scope.read_set[0].required);
    }
}
