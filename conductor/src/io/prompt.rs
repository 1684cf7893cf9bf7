//! Prompt pack builder for deterministic agent input.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

const STATION_TEMPLATE: &str = include_str!("prompts/station.md");

/// One gathered input artifact for template rendering.
#[derive(Debug, Clone, Serialize)]
pub struct InputArtifact {
    pub path: String,
    pub content: String,
}

/// All inputs needed to build a station prompt pack.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub station_name: String,
    pub flow: String,
    /// The station's configured prompt prose.
    pub station_prompt: String,
    pub inputs: Vec<InputArtifact>,
    /// Declared best-effort inputs that were absent.
    pub missing_inputs: Vec<String>,
    /// Blockers from the previous attempt of this station, if any.
    pub feedback: Option<String>,
    /// Contents of the shared open-questions register, if present.
    pub questions: Option<String>,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("station", STATION_TEMPLATE)
            .expect("station template should be valid");
        Self { env }
    }

    fn render(&self, input: &PromptInputs) -> Result<String> {
        let template = self.env.get_template("station")?;
        let rendered = template.render(context! {
            station_name => input.station_name.as_str(),
            flow => input.flow.as_str(),
            station_prompt => input.station_prompt.trim(),
            inputs => &input.inputs,
            missing_inputs => (!input.missing_inputs.is_empty()).then_some(&input.missing_inputs),
            feedback => input.feedback.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            questions => input.questions.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let mut sections = Vec::new();
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();

    for (i, caps) in matches.iter().enumerate() {
        let key = caps.get(1).unwrap().as_str().to_string();
        let required = caps.get(2).unwrap().as_str() == "required";
        let start = caps.get(0).unwrap().end();
        let end = matches
            .get(i + 1)
            .map(|m| m.get(0).unwrap().start())
            .unwrap_or(rendered.len());

        let content = rendered[start..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key,
                required,
                content,
            });
        }
    }

    sections
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
///
/// Drop order: questions -> feedback.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    for key in ["questions", "feedback"] {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // If still over budget, truncate the last section.
    if total_len(sections) > budget && !sections.is_empty() {
        let other_len: usize = sections
            .iter()
            .take(sections.len() - 1)
            .map(|s| s.content.len())
            .sum();
        let allowed = budget.saturating_sub(other_len);
        let last = sections.last_mut().unwrap();
        if last.content.len() > allowed {
            let before_len = last.content.len();
            if allowed > 12 {
                last.content.truncate(allowed - 12);
                last.content.push_str("\n[truncated]");
            } else {
                last.content.truncate(allowed);
            }
            debug!(
                section = last.key,
                before_len,
                after_len = last.content.len(),
                "truncated section for budget"
            );
        }
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds a prompt pack within a byte budget, dropping less critical sections
/// first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs) -> Result<PromptPack> {
        let rendered = PromptEngine::new().render(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(PromptPack {
            content: render_sections(&sections),
        })
    }
}

/// A rendered prompt ready to feed to the agent.
#[derive(Debug, Clone)]
pub struct PromptPack {
    content: String,
}

impl PromptPack {
    pub fn render(&self) -> String {
        self.content.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> PromptInputs {
        PromptInputs {
            station_name: "bdd-author".to_string(),
            flow: "signal".to_string(),
            station_prompt: "Turn requirements into features.".to_string(),
            inputs: vec![InputArtifact {
                path: "signal/requirements.md".to_string(),
                content: "# Requirements".to_string(),
            }],
            missing_inputs: Vec::new(),
            feedback: Some("previous blocker".to_string()),
            questions: Some("open question".to_string()),
        }
    }

    /// Section order is part of the prompt contract: contract -> station ->
    /// inputs -> feedback -> questions.
    #[test]
    fn prompt_ordering_is_stable() {
        let pack = PromptBuilder::new(10_000).build(&inputs()).expect("build");
        let content = pack.render();

        let contract_pos = content.find("### Station Contract").expect("contract");
        let station_pos = content.find("### Station Prompt").expect("station");
        let inputs_pos = content.find("### Inputs").expect("inputs");
        let feedback_pos = content
            .find("### Previous Attempt Feedback")
            .expect("feedback");
        let questions_pos = content.find("### Open Questions").expect("questions");

        assert!(contract_pos < station_pos, "contract before station");
        assert!(station_pos < inputs_pos, "station before inputs");
        assert!(inputs_pos < feedback_pos, "inputs before feedback");
        assert!(feedback_pos < questions_pos, "feedback before questions");
    }

    #[test]
    fn budget_drops_questions_and_feedback_first() {
        let mut input = inputs();
        input.feedback = Some("feedback ".repeat(100));
        input.questions = Some("question ".repeat(100));

        let pack = PromptBuilder::new(1_400).build(&input).expect("build");
        let content = pack.render();

        assert!(!content.contains("### Open Questions"), "questions dropped");
        assert!(
            content.contains("### Station Contract"),
            "contract remains"
        );
        assert!(
            content.contains("signal/requirements.md"),
            "inputs remain"
        );
    }

    #[test]
    fn missing_best_effort_inputs_are_called_out() {
        let mut input = inputs();
        input.missing_inputs = vec!["signal/features.md".to_string()];
        let pack = PromptBuilder::new(10_000).build(&input).expect("build");
        let content = pack.render();
        assert!(content.contains("signal/features.md"));
        assert!(content.contains("at most UNVERIFIED"));
    }

    #[test]
    fn template_uses_xml_tags() {
        let pack = PromptBuilder::new(10_000).build(&inputs()).expect("build");
        let content = pack.render();
        assert!(content.contains("<contract>"));
        assert!(content.contains("</contract>"));
        assert!(content.contains("<station name=\"bdd-author\" flow=\"signal\">"));
        assert!(content.contains("<input path=\"signal/requirements.md\">"));
    }
}
