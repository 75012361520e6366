//! Issue, milestone and project records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::document::Document;
use crate::error::{Result, RoadmapError};

/// Front-matter keys owned by the sync engine. Everything else in the
/// document belongs to the user and is never written by sync.
pub const SYNC_KEYS: [&str; 4] = ["remote_ids", "sync_status", "last_synced_at", "fingerprint"];

/// Front-matter key marking files written by a sync tool.
pub const CREATED_BY_KEY: &str = "created_by";

const FIELD_KEYS: [&str; 12] = [
    "id",
    "kind",
    "title",
    "status",
    "priority",
    "labels",
    "assignees",
    "milestone",
    "project",
    "due_date",
    "created_at",
    "updated_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Issue,
    Milestone,
    Project,
}

impl EntityKind {
    pub const ALL: [Self; 3] = [Self::Issue, Self::Milestone, Self::Project];

    /// Directory under `.roadmap/` holding this kind's files.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Issue => "issues",
            Self::Milestone => "milestones",
            Self::Project => "projects",
        }
    }

    #[must_use]
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::Issue => "iss",
            Self::Milestone => "ms",
            Self::Project => "prj",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Milestone => "milestone",
            Self::Project => "project",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "issue" | "issues" => Ok(Self::Issue),
            "milestone" | "milestones" => Ok(Self::Milestone),
            "project" | "projects" => Ok(Self::Project),
            _ => Err(RoadmapError::ValidationFailed(format!(
                "unknown entity kind: {value} (use issue|milestone|project)"
            ))),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    #[default]
    Pending,
    Conflict,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// User-visible content. Exactly these fields feed the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFields {
    pub title: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(skip)]
    pub body: String,
}

fn default_status() -> String {
    "open".to_string()
}

impl EntityFields {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            status: default_status(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.status.as_str(), "closed" | "done" | "completed")
    }
}

/// Sync metadata carried in front matter. Never part of the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    #[serde(default)]
    pub remote_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub fields: EntityFields,
    /// `None` when the file never carried the key; it is then not written.
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub sync: SyncMeta,
    document: Document,
}

#[derive(Debug, Deserialize)]
struct TypedFrontMatter {
    id: String,
    kind: EntityKind,
    #[serde(flatten)]
    fields: EntityFields,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    sync: SyncMeta,
}

impl Entity {
    /// Create a fresh local entity with a newly allocated id.
    pub fn new(kind: EntityKind, fields: EntityFields) -> Self {
        let id = Self::allocate_id(kind);
        Self::with_id(id, kind, fields)
    }

    pub fn with_id(id: impl Into<String>, kind: EntityKind, fields: EntityFields) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            fields,
            created_at: Some(now),
            updated_at: Some(now),
            sync: SyncMeta::default(),
            document: Document::new(serde_yaml::Mapping::new(), String::new()),
        }
    }

    /// `<prefix>-<8 hex>`, e.g. `iss-3f9a0c12`.
    pub fn allocate_id(kind: EntityKind) -> String {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("{}-{}", kind.id_prefix(), &uuid[..8])
    }

    pub fn from_document(text: &str, origin: &str) -> Result<Self> {
        let document = Document::parse(text, origin)?;
        let typed: TypedFrontMatter =
            serde_yaml::from_value(Value::Mapping(document.front_matter.clone())).map_err(
                |err| RoadmapError::InvalidEntity {
                    path: origin.to_string(),
                    reason: err.to_string(),
                },
            )?;

        let mut fields = typed.fields;
        fields.body.clone_from(&document.body);
        Ok(Self {
            id: typed.id,
            kind: typed.kind,
            fields,
            created_at: typed.created_at,
            updated_at: typed.updated_at,
            sync: typed.sync,
            document,
        })
    }

    /// Render to file text. Unknown front-matter keys keep their values
    /// and order; only typed keys are rewritten.
    pub fn to_document(&self) -> Result<String> {
        let mut doc = self.content_document()?;
        let mut sync = self.sync.clone();
        sync.fingerprint = Some(self.fingerprint());
        let sync = serde_yaml::to_value(&sync)?;
        write_keys(&mut doc, &sync, &SYNC_KEYS);
        doc.render()
    }

    /// Render the copy shared through a remote: user content tagged with
    /// `created_by`, without this clone's sync metadata.
    pub fn to_shared_document(&self, created_by: &str) -> Result<String> {
        let mut doc = self.content_document()?;
        for key in SYNC_KEYS {
            doc.remove(key);
        }
        doc.set(CREATED_BY_KEY, Value::String(created_by.to_string()));
        doc.render()
    }

    fn content_document(&self) -> Result<Document> {
        let mut doc = self.document.clone();
        doc.body.clone_from(&self.fields.body);

        doc.set("id", Value::String(self.id.clone()));
        doc.set("kind", serde_yaml::to_value(self.kind)?);
        let fields = serde_yaml::to_value(&self.fields)?;
        write_keys(&mut doc, &fields, &FIELD_KEYS[2..10]);
        if let Some(created_at) = self.created_at {
            doc.set("created_at", serde_yaml::to_value(created_at)?);
        }
        if let Some(updated_at) = self.updated_at {
            doc.set("updated_at", serde_yaml::to_value(updated_at)?);
        }
        Ok(doc)
    }

    /// Tool name from the `created_by` marker of a shared copy.
    #[must_use]
    pub fn created_by(&self) -> Option<&str> {
        self.document.get(CREATED_BY_KEY).and_then(Value::as_str)
    }

    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(self.kind, &self.fields)
    }

    #[must_use]
    pub fn remote_id(&self, backend: &str) -> Option<&str> {
        self.sync.remote_ids.get(backend).map(String::as_str)
    }

    pub fn link_remote(&mut self, backend: &str, remote_id: impl Into<String>) {
        self.sync.remote_ids.insert(backend.to_string(), remote_id.into());
    }

    pub fn unlink_remote(&mut self, backend: &str) -> Option<String> {
        self.sync.remote_ids.remove(backend)
    }

    /// Overwrite user-visible content with what a remote reported.
    pub fn apply_remote(&mut self, fields: EntityFields, updated_at: Option<DateTime<Utc>>) {
        self.fields = fields;
        if updated_at.is_some() {
            self.updated_at = updated_at;
        }
    }

    /// Raw front-matter value for a key this crate does not model.
    #[must_use]
    pub fn extra(&self, key: &str) -> Option<&Value> {
        if FIELD_KEYS.contains(&key) || SYNC_KEYS.contains(&key) {
            return None;
        }
        self.document.get(key)
    }
}

fn write_keys(doc: &mut Document, source: &Value, keys: &[&str]) {
    for key in keys {
        match source.get(*key) {
            Some(value) if !value.is_null() => doc.set(key, value.clone()),
            _ => doc.remove(key),
        }
    }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    kind: EntityKind,
    title: &'a str,
    status: &'a str,
    priority: Option<&'a str>,
    labels: Vec<&'a str>,
    assignees: Vec<&'a str>,
    milestone: Option<&'a str>,
    project: Option<&'a str>,
    due_date: Option<NaiveDate>,
    body: &'a str,
}

/// SHA-256 over the canonical JSON of the user-visible fields.
///
/// Title, status, priority and body are trimmed at both ends. Labels and
/// assignees are compared as sets of trimmed, non-empty values. Milestone,
/// project and due date are taken as-is. Remotes that reorder or trim still
/// round-trip.
#[must_use]
pub fn fingerprint(kind: EntityKind, fields: &EntityFields) -> String {
    let input = FingerprintInput {
        kind,
        title: fields.title.trim(),
        status: fields.status.trim(),
        priority: fields.priority.as_deref().map(str::trim),
        labels: canonical_set(&fields.labels),
        assignees: canonical_set(&fields.assignees),
        milestone: fields.milestone.as_deref(),
        project: fields.project.as_deref(),
        due_date: fields.due_date,
        body: fields.body.trim(),
    };
    let json = serde_json::to_vec(&input).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&json);
    hex::encode(hasher.finalize())
}

fn canonical_set(values: &[String]) -> Vec<&str> {
    let mut out: Vec<&str> = values.iter().map(|v| v.trim()).filter(|v| !v.is_empty()).collect();
    out.sort_unstable();
    out.dedup();
    out
}
