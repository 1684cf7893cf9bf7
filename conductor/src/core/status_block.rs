//! Parsing and rendering of the fenced station return block.
//!
//! Agents return free text containing one fenced `status` block. Everything
//! outside the block is handoff prose for human operators; the block itself is
//! parsed strictly: closed enums, closed key set, no unresolved placeholders.
//! Unknown values fail closed; the orchestrator treats any parse failure as
//! CANNOT_PROCEED rather than guessing intent.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::core::types::{
    RecommendedAction, RoutingDirective, RoutingTarget, StationClass, Status, StatusRecord,
};

/// Why a station return failed to parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedStatus {
    #[error("no fenced status block found in station return")]
    MissingBlock,
    #[error("unresolved placeholder '{token}' inside status block")]
    PlaceholderLeak { token: String },
    #[error("unknown key '{key}' in status block")]
    UnknownKey { key: String },
    #[error("duplicate key '{key}' in status block")]
    DuplicateKey { key: String },
    #[error("unknown value '{value}' for '{key}'")]
    UnknownValue { key: String, value: String },
    #[error("missing required field '{field}'")]
    MissingField { field: String },
    #[error("list item outside a blockers list")]
    StrayListItem,
    #[error("status '{status}' is not valid for a {class:?}-class station")]
    ClassMismatch { status: String, class: StationClass },
    #[error("gate-class stations must not carry '{field}'")]
    GateForbidden { field: String },
    #[error("work-class stations must not carry '{field}'")]
    WorkForbidden { field: String },
    #[error("routing_directive {directive} requires a routing_target")]
    TargetRequired { directive: String },
    #[error("routing_directive {directive} does not take a routing_target")]
    TargetForbidden { directive: String },
}

/// A parsed station return: the machine record plus operator-facing prose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReturn {
    pub record: StatusRecord,
    /// Free text outside the fenced block, surfaced to humans only.
    pub handoff: Option<String>,
}

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[A-Z][A-Z0-9_]*>").expect("placeholder pattern is valid"));

/// Find the first unresolved template token in `text`, if any.
pub fn find_placeholder(text: &str) -> Option<&str> {
    PLACEHOLDER_RE.find(text).map(|found| found.as_str())
}

/// Parse a raw station return for a station of the given class.
pub fn parse(raw: &str, class: StationClass) -> Result<ParsedReturn, MalformedStatus> {
    let (block, handoff) = extract_block(raw)?;

    if let Some(token) = find_placeholder(&block) {
        return Err(MalformedStatus::PlaceholderLeak {
            token: token.to_string(),
        });
    }

    let fields = parse_fields(&block)?;
    let record = build_record(fields, class)?;

    Ok(ParsedReturn {
        record,
        handoff: (!handoff.is_empty()).then_some(handoff),
    })
}

/// Render a record back into the fenced block format.
///
/// `parse(render_status_block(r), class)` yields `r` for any record valid for
/// `class`; the round-trip tests pin this down.
pub fn render_status_block(record: &StatusRecord) -> String {
    let mut out = String::from("```status\n");
    out.push_str(&format!("status: {}\n", record.status));
    out.push_str(&format!(
        "recommended_action: {}\n",
        record.recommended_action
    ));
    if let Some(directive) = record.routing_directive {
        out.push_str(&format!("routing_directive: {directive}\n"));
    }
    if let Some(target) = &record.routing_target {
        out.push_str(&format!("routing_target: {target}\n"));
    }
    if !record.blockers.is_empty() {
        out.push_str("blockers:\n");
        for blocker in &record.blockers {
            out.push_str(&format!("- {blocker}\n"));
        }
    }
    if let Some(flag) = record.safe_to_commit {
        out.push_str(&format!("safe_to_commit: {flag}\n"));
    }
    if let Some(flag) = record.safe_to_publish {
        out.push_str(&format!("safe_to_publish: {flag}\n"));
    }
    out.push_str("```\n");
    out
}

/// Split `raw` into the status block body and the surrounding handoff prose.
///
/// Prefers a fence tagged `status`; falls back to the first untagged fence
/// whose body carries a `status:` line. Commentary outside the fence is
/// tolerated by design.
fn extract_block(raw: &str) -> Result<(String, String), MalformedStatus> {
    let fences = collect_fences(raw);
    let chosen = fences
        .iter()
        .find(|fence| fence.tag == "status")
        .or_else(|| {
            fences.iter().find(|fence| {
                fence.tag.is_empty()
                    && fence
                        .body
                        .lines()
                        .any(|line| line.trim_start().starts_with("status:"))
            })
        })
        .ok_or(MalformedStatus::MissingBlock)?;

    let mut handoff = String::new();
    handoff.push_str(raw[..chosen.start].trim());
    let after = raw[chosen.end..].trim();
    if !after.is_empty() {
        if !handoff.is_empty() {
            handoff.push_str("\n\n");
        }
        handoff.push_str(after);
    }
    Ok((chosen.body.clone(), handoff))
}

struct Fence {
    tag: String,
    body: String,
    start: usize,
    end: usize,
}

fn collect_fences(raw: &str) -> Vec<Fence> {
    let mut fences = Vec::new();
    let mut offset = 0;
    let mut open: Option<(String, usize, usize)> = None;

    for line in raw.split_inclusive('\n') {
        let trimmed = line.trim_end();
        let line_start = offset;
        offset += line.len();

        match &open {
            None => {
                if let Some(rest) = trimmed.trim_start().strip_prefix("```") {
                    open = Some((rest.trim().to_string(), line_start, offset));
                }
            }
            Some((tag, fence_start, body_start)) => {
                if trimmed.trim_start() == "```" {
                    fences.push(Fence {
                        tag: tag.clone(),
                        body: raw[*body_start..line_start].to_string(),
                        start: *fence_start,
                        end: offset,
                    });
                    open = None;
                }
            }
        }
    }
    fences
}

struct Fields {
    status: Option<String>,
    recommended_action: Option<String>,
    routing_directive: Option<String>,
    routing_target: Option<String>,
    blockers: Option<Vec<String>>,
    safe_to_commit: Option<String>,
    safe_to_publish: Option<String>,
}

fn parse_fields(block: &str) -> Result<Fields, MalformedStatus> {
    let mut fields = Fields {
        status: None,
        recommended_action: None,
        routing_directive: None,
        routing_target: None,
        blockers: None,
        safe_to_commit: None,
        safe_to_publish: None,
    };
    let mut in_blockers = false;

    for line in block.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(item) = line.strip_prefix("- ") {
            if !in_blockers {
                return Err(MalformedStatus::StrayListItem);
            }
            fields
                .blockers
                .get_or_insert_with(Vec::new)
                .push(item.trim().to_string());
            continue;
        }
        in_blockers = false;

        let Some((key, value)) = line.split_once(':') else {
            return Err(MalformedStatus::UnknownKey {
                key: line.to_string(),
            });
        };
        let key = key.trim();
        let value = value.trim().to_string();

        let slot = match key {
            "status" => &mut fields.status,
            "recommended_action" => &mut fields.recommended_action,
            "routing_directive" => &mut fields.routing_directive,
            "routing_target" => &mut fields.routing_target,
            "blockers" => {
                if fields.blockers.is_some() {
                    return Err(MalformedStatus::DuplicateKey {
                        key: key.to_string(),
                    });
                }
                fields.blockers = Some(Vec::new());
                in_blockers = true;
                if !value.is_empty() && value != "[]" {
                    return Err(MalformedStatus::UnknownValue {
                        key: key.to_string(),
                        value,
                    });
                }
                continue;
            }
            "safe_to_commit" => &mut fields.safe_to_commit,
            "safe_to_publish" => &mut fields.safe_to_publish,
            other => {
                return Err(MalformedStatus::UnknownKey {
                    key: other.to_string(),
                });
            }
        };
        if slot.is_some() {
            return Err(MalformedStatus::DuplicateKey {
                key: key.to_string(),
            });
        }
        *slot = Some(value);
    }

    Ok(fields)
}

fn build_record(fields: Fields, class: StationClass) -> Result<StatusRecord, MalformedStatus> {
    let status_raw = fields.status.ok_or_else(|| MalformedStatus::MissingField {
        field: "status".to_string(),
    })?;
    let status = Status::parse(&status_raw).ok_or_else(|| MalformedStatus::UnknownValue {
        key: "status".to_string(),
        value: status_raw.clone(),
    })?;
    if status.class() != class {
        return Err(MalformedStatus::ClassMismatch {
            status: status_raw,
            class,
        });
    }

    let action_raw = fields
        .recommended_action
        .ok_or_else(|| MalformedStatus::MissingField {
            field: "recommended_action".to_string(),
        })?;
    let recommended_action =
        RecommendedAction::parse(&action_raw).ok_or_else(|| MalformedStatus::UnknownValue {
            key: "recommended_action".to_string(),
            value: action_raw,
        })?;

    let routing_directive = match fields.routing_directive.as_deref() {
        None | Some("null") | Some("none") | Some("") => None,
        Some(raw) => Some(RoutingDirective::parse(raw).ok_or_else(|| {
            MalformedStatus::UnknownValue {
                key: "routing_directive".to_string(),
                value: raw.to_string(),
            }
        })?),
    };

    let routing_target = match fields.routing_target.as_deref() {
        None | Some("null") | Some("") => None,
        Some(raw) => Some(RoutingTarget::parse(raw).ok_or_else(|| {
            MalformedStatus::UnknownValue {
                key: "routing_target".to_string(),
                value: raw.to_string(),
            }
        })?),
    };

    match routing_directive {
        Some(RoutingDirective::Continue) if routing_target.is_some() => {
            return Err(MalformedStatus::TargetForbidden {
                directive: "CONTINUE".to_string(),
            });
        }
        Some(directive)
            if directive != RoutingDirective::Continue && routing_target.is_none() =>
        {
            return Err(MalformedStatus::TargetRequired {
                directive: directive.to_string(),
            });
        }
        _ => {}
    }

    let parse_bool = |key: &str, value: Option<String>| -> Result<Option<bool>, MalformedStatus> {
        match value.as_deref() {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => Err(MalformedStatus::UnknownValue {
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    };
    let safe_to_commit = parse_bool("safe_to_commit", fields.safe_to_commit)?;
    let safe_to_publish = parse_bool("safe_to_publish", fields.safe_to_publish)?;

    match class {
        StationClass::Gate => {
            if routing_directive.is_some() {
                return Err(MalformedStatus::GateForbidden {
                    field: "routing_directive".to_string(),
                });
            }
            if routing_target.is_some() {
                return Err(MalformedStatus::GateForbidden {
                    field: "routing_target".to_string(),
                });
            }
            if safe_to_commit.is_none() {
                return Err(MalformedStatus::MissingField {
                    field: "safe_to_commit".to_string(),
                });
            }
            if safe_to_publish.is_none() {
                return Err(MalformedStatus::MissingField {
                    field: "safe_to_publish".to_string(),
                });
            }
        }
        StationClass::Work => {
            if safe_to_commit.is_some() {
                return Err(MalformedStatus::WorkForbidden {
                    field: "safe_to_commit".to_string(),
                });
            }
            if safe_to_publish.is_some() {
                return Err(MalformedStatus::WorkForbidden {
                    field: "safe_to_publish".to_string(),
                });
            }
        }
    }

    Ok(StatusRecord {
        status,
        recommended_action,
        routing_directive,
        routing_target,
        blockers: fields.blockers.unwrap_or_default(),
        safe_to_commit,
        safe_to_publish,
    })
}
