//! Test-only helpers: scripted agent invokers and project fixtures.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};

use crate::core::graph::default_graph;
use crate::core::status_block::render_status_block;
use crate::core::types::{
    RecommendedAction, RoutingDirective, RoutingTarget, Status, StatusRecord,
};
use crate::io::agent::{AgentInvoker, InvokeRequest, MechanicalFailure};
use crate::io::init::{InitOptions, init_layout};
use crate::start::start_run;

/// What a scripted invocation returns.
#[derive(Debug, Clone)]
pub enum ScriptedReturn {
    /// Raw return text handed back as the agent's output.
    Text(String),
    /// Simulate a broken environment (spawn failure).
    Mechanical,
}

/// One scripted invocation: files to stage, then the return.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    /// Files written into the staging dir before returning, as
    /// (run-root-relative path, content).
    pub stage: Vec<(String, String)>,
    pub output: ScriptedReturn,
}

impl ScriptedStep {
    pub fn returning(text: impl Into<String>) -> Self {
        Self {
            stage: Vec::new(),
            output: ScriptedReturn::Text(text.into()),
        }
    }

    pub fn staging(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.stage.push((path.into(), content.into()));
        self
    }

    pub fn mechanical() -> Self {
        Self {
            stage: Vec::new(),
            output: ScriptedReturn::Mechanical,
        }
    }
}

/// Invoker that replays a fixed script instead of spawning processes.
pub struct ScriptedInvoker {
    steps: RefCell<VecDeque<ScriptedStep>>,
}

impl ScriptedInvoker {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: RefCell::new(steps.into()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.steps.borrow().len()
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn invoke(&self, request: &InvokeRequest) -> Result<String> {
        let step = self
            .steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted invoker exhausted"))?;
        for (path, content) in &step.stage {
            let full = request.workdir.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&full, content)?;
        }
        match step.output {
            ScriptedReturn::Text(text) => Ok(text),
            ScriptedReturn::Mechanical => Err(MechanicalFailure::Spawn {
                reason: "scripted failure".to_string(),
            }
            .into()),
        }
    }
}

/// Wrap a record in prose + fenced block, the way agents actually answer.
pub fn return_text(record: &StatusRecord) -> String {
    format!(
        "Work notes.\n\n{}\n## Handoff\nDone with this station.\n",
        render_status_block(record)
    )
}

/// Work-class record builder.
pub fn work_record(
    status: Status,
    action: RecommendedAction,
    directive: Option<RoutingDirective>,
    target: Option<RoutingTarget>,
) -> StatusRecord {
    StatusRecord {
        status,
        recommended_action: action,
        routing_directive: directive,
        routing_target: target,
        blockers: Vec::new(),
        safe_to_commit: None,
        safe_to_publish: None,
    }
}

/// The canonical "all good, move on" return text.
pub fn verified_continue_text() -> String {
    return_text(&work_record(
        Status::Verified,
        RecommendedAction::Proceed,
        Some(RoutingDirective::Continue),
        None,
    ))
}

/// Gate-class record builder.
pub fn gate_record(status: Status, safe_to_commit: bool, safe_to_publish: bool) -> StatusRecord {
    StatusRecord {
        status,
        recommended_action: if safe_to_publish {
            RecommendedAction::Proceed
        } else {
            RecommendedAction::FixEnv
        },
        routing_directive: None,
        routing_target: None,
        blockers: Vec::new(),
        safe_to_commit: Some(safe_to_commit),
        safe_to_publish: Some(safe_to_publish),
    }
}

/// A project directory with an initialized `.runs` layout.
pub struct TestProject {
    temp: tempfile::TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        init_layout(temp.path(), &default_graph(), &InitOptions { force: false })?;
        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Start a run and return its id.
    pub fn start(&self) -> Result<String> {
        Ok(start_run(self.root())?.run_id)
    }

    pub fn run_dir(&self, run_id: &str) -> std::path::PathBuf {
        self.root().join(".runs").join(run_id)
    }
}
