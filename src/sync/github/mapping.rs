//! Translation between local entities and GitHub issues/milestones.
//!
//! Issues and projects become GitHub issues (projects carry the configured
//! project label). Milestones become GitHub milestones. Fields GitHub
//! cannot hold (issue due dates, project membership, unmapped milestones)
//! are left out of the payload and restored from the local copy on pull.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde_json::{Value, json};

use crate::config::GitHubConfig;
use crate::core::{Entity, EntityFields, EntityKind};
use crate::sync::backend::RemoteEntity;

const STATUS_PREFIX: &str = "status:";
const PRIORITY_PREFIX: &str = "priority:";
/// Remote ids of milestones are `milestone/<number>`; issues use the bare number.
pub const MILESTONE_ID_PREFIX: &str = "milestone/";

static MARKER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"<!--\s*roadmap:id=([A-Za-z0-9_.-]+)\s*-->").ok());

/// Body text with the created-by-tool marker appended.
#[must_use]
pub fn with_marker(body: &str, local_id: &str) -> String {
    let trimmed = body.trim_end();
    if trimmed.is_empty() {
        format!("<!-- roadmap:id={local_id} -->")
    } else {
        format!("{trimmed}\n\n<!-- roadmap:id={local_id} -->")
    }
}

/// Strip the marker, returning the user body and the embedded local id.
#[must_use]
pub fn split_marker(body: &str) -> (String, Option<String>) {
    let Some(re) = MARKER.as_ref() else {
        return (body.to_string(), None);
    };
    let Some(caps) = re.captures(body) else {
        return (body.to_string(), None);
    };
    let id = caps.get(1).map(|m| m.as_str().to_string());
    let start = caps.get(0).map_or(body.len(), |m| m.start());
    let end = caps.get(0).map_or(body.len(), |m| m.end());
    let mut text = body[..start].trim_end().to_string();
    let rest = body[end..].trim();
    if !rest.is_empty() {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(rest);
    }
    if !text.is_empty() {
        text.push('\n');
    }
    (text, id)
}

#[must_use]
pub fn milestone_remote_id(number: u64) -> String {
    format!("{MILESTONE_ID_PREFIX}{number}")
}

/// Issue or milestone number from a remote id.
#[must_use]
pub fn remote_number(remote_id: &str) -> Option<u64> {
    remote_id
        .strip_prefix(MILESTONE_ID_PREFIX)
        .unwrap_or(remote_id)
        .parse()
        .ok()
}

/// Name translation tables built from `[github]` config.
#[derive(Debug, Clone, Default)]
pub struct FieldMapping {
    labels: BTreeMap<String, String>,
    labels_rev: BTreeMap<String, String>,
    assignees: BTreeMap<String, String>,
    assignees_rev: BTreeMap<String, String>,
    milestones: BTreeMap<String, u64>,
    milestones_rev: BTreeMap<u64, String>,
    project_label: String,
}

fn reversed<K: Clone, V: Clone + Ord>(map: &BTreeMap<K, V>) -> BTreeMap<V, K> {
    map.iter().map(|(k, v)| (v.clone(), k.clone())).collect()
}

fn translate(table: &BTreeMap<String, String>, value: &str) -> String {
    table.get(value).cloned().unwrap_or_else(|| value.to_string())
}

impl FieldMapping {
    #[must_use]
    pub fn from_config(config: &GitHubConfig) -> Self {
        Self {
            labels_rev: reversed(&config.labels),
            labels: config.labels.clone(),
            assignees_rev: reversed(&config.assignees),
            assignees: config.assignees.clone(),
            milestones_rev: reversed(&config.milestones),
            milestones: config.milestones.clone(),
            project_label: config.project_label.clone(),
        }
    }

    /// Whether a local milestone reference can be expressed remotely.
    #[must_use]
    pub fn maps_milestone(&self, milestone: &str) -> bool {
        self.milestones.contains_key(milestone)
    }

    /// JSON body for creating or updating the issue behind `entity`.
    #[must_use]
    pub fn issue_payload(&self, entity: &Entity) -> Value {
        let fields = &entity.fields;
        let closed = fields.is_closed();

        let mut labels: Vec<String> = fields
            .labels
            .iter()
            .map(|l| translate(&self.labels, l.trim()))
            .filter(|l| !l.is_empty())
            .collect();
        let status = fields.status.trim();
        if (closed && status != "closed") || (!closed && status != "open") {
            labels.push(format!("{STATUS_PREFIX}{status}"));
        }
        if let Some(priority) = fields.priority.as_deref().map(str::trim) {
            labels.push(format!("{PRIORITY_PREFIX}{priority}"));
        }
        if entity.kind == EntityKind::Project {
            labels.push(self.project_label.clone());
        }
        labels.sort();
        labels.dedup();

        let assignees: Vec<String> = fields
            .assignees
            .iter()
            .map(|a| translate(&self.assignees, a.trim()))
            .collect();

        let milestone = fields
            .milestone
            .as_deref()
            .and_then(|m| self.milestones.get(m))
            .map_or(Value::Null, |n| json!(n));

        json!({
            "title": fields.title,
            "body": with_marker(&fields.body, &entity.id),
            "state": if closed { "closed" } else { "open" },
            "labels": labels,
            "assignees": assignees,
            "milestone": milestone,
        })
    }

    #[must_use]
    pub fn milestone_payload(&self, entity: &Entity) -> Value {
        let fields = &entity.fields;
        let due_on = fields
            .due_date
            .map_or(Value::Null, |d| json!(format!("{d}T12:00:00Z")));
        json!({
            "title": fields.title,
            "description": with_marker(&fields.body, &entity.id),
            "state": if fields.is_closed() { "closed" } else { "open" },
            "due_on": due_on,
        })
    }

    /// Map an issue from the API. Pull requests yield `None`.
    #[must_use]
    pub fn issue_from_json(&self, issue: &Value) -> Option<RemoteEntity> {
        if issue.get("pull_request").is_some() {
            return None;
        }
        let number = issue.get("number")?.as_u64()?;
        let closed = issue.get("state").and_then(Value::as_str) == Some("closed");
        let (body, local_id) = split_marker(issue.get("body").and_then(Value::as_str).unwrap_or(""));

        let mut kind = EntityKind::Issue;
        let mut status_label = None;
        let mut priority = None;
        let mut labels = Vec::new();
        for name in issue
            .get("labels")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(label_name)
        {
            if name == self.project_label {
                kind = EntityKind::Project;
            } else if let Some(status) = name.strip_prefix(STATUS_PREFIX) {
                status_label = Some(status.to_string());
            } else if let Some(p) = name.strip_prefix(PRIORITY_PREFIX) {
                priority = Some(p.to_string());
            } else {
                labels.push(translate(&self.labels_rev, name));
            }
        }
        labels.sort();

        let mut assignees: Vec<String> = issue
            .get("assignees")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|a| a.get("login").and_then(Value::as_str))
            .map(|login| translate(&self.assignees_rev, login))
            .collect();
        assignees.sort();

        let milestone = issue
            .get("milestone")
            .and_then(|m| m.get("number"))
            .and_then(Value::as_u64)
            .and_then(|n| self.milestones_rev.get(&n).cloned());

        let status = issue_status(closed, status_label);
        let fields = EntityFields {
            title: str_field(issue, "title"),
            status,
            priority,
            labels,
            assignees,
            milestone,
            project: None,
            due_date: None,
            body,
        };
        Some(RemoteEntity {
            remote_id: number.to_string(),
            kind,
            created_by_tool: local_id.is_some(),
            local_id,
            closed,
            fields,
            updated_at: timestamp(issue, "updated_at"),
        })
    }

    #[must_use]
    pub fn milestone_from_json(&self, milestone: &Value) -> Option<RemoteEntity> {
        let number = milestone.get("number")?.as_u64()?;
        let closed = milestone.get("state").and_then(Value::as_str) == Some("closed");
        let (body, local_id) =
            split_marker(milestone.get("description").and_then(Value::as_str).unwrap_or(""));
        let due_date = milestone
            .get("due_on")
            .and_then(Value::as_str)
            .and_then(parse_due_on);
        let fields = EntityFields {
            title: str_field(milestone, "title"),
            status: if closed { "closed" } else { "open" }.to_string(),
            due_date,
            body,
            ..EntityFields::default()
        };
        Some(RemoteEntity {
            remote_id: milestone_remote_id(number),
            kind: EntityKind::Milestone,
            created_by_tool: local_id.is_some(),
            local_id,
            closed,
            fields,
            updated_at: timestamp(milestone, "updated_at"),
        })
    }

    /// Restore what GitHub cannot represent from the local copy.
    #[must_use]
    pub fn merge(
        &self,
        kind: EntityKind,
        local: Option<&EntityFields>,
        remote: &EntityFields,
    ) -> EntityFields {
        let Some(local) = local else {
            return remote.clone();
        };
        let mut merged = remote.clone();
        match kind {
            EntityKind::Milestone => {
                merged.labels.clone_from(&local.labels);
                merged.assignees.clone_from(&local.assignees);
                merged.priority.clone_from(&local.priority);
                merged.milestone.clone_from(&local.milestone);
                merged.project.clone_from(&local.project);
                if local.is_closed() == remote.is_closed() {
                    merged.status.clone_from(&local.status);
                }
            }
            EntityKind::Issue | EntityKind::Project => {
                merged.due_date = local.due_date;
                merged.project.clone_from(&local.project);
                if let Some(m) = local.milestone.as_deref() {
                    if !self.maps_milestone(m) {
                        merged.milestone = Some(m.to_string());
                    }
                }
            }
        }
        merged
    }
}

fn issue_status(closed: bool, label: Option<String>) -> String {
    match label {
        Some(status) => {
            let as_status = EntityFields {
                status: status.clone(),
                ..EntityFields::default()
            };
            if as_status.is_closed() == closed {
                status
            } else if closed {
                "closed".to_string()
            } else {
                "open".to_string()
            }
        }
        None if closed => "closed".to_string(),
        None => "open".to_string(),
    }
}

fn label_name(label: &Value) -> Option<&str> {
    match label {
        Value::String(name) => Some(name),
        other => other.get("name").and_then(Value::as_str),
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

fn timestamp(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn parse_due_on(value: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc).date_naive())
}
