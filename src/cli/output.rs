use colored::Colorize;
use serde::Serialize;

use crate::error::{Result, RoadmapError, StructuredError};
use crate::sync::{Action, EntityOutcome, EntityState, Resolution, SyncReport};

pub fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value)?;
    println!("{payload}");
    Ok(())
}

/// Error envelope printed on stdout in `--json` mode.
#[derive(Serialize)]
struct ErrorEnvelope {
    status: &'static str,
    error: StructuredError,
}

pub fn emit_error(err: &RoadmapError, json: bool) {
    if json {
        let envelope = ErrorEnvelope {
            status: "error",
            error: err.to_structured(),
        };
        match serde_json::to_string_pretty(&envelope) {
            Ok(payload) => println!("{payload}"),
            Err(_) => eprintln!("Error: {err}"),
        }
    } else {
        let structured = err.to_structured();
        eprintln!("{} {err}", "Error:".red().bold());
        eprintln!("  {}", structured.suggestion.dimmed());
    }
}

pub struct HumanLayout {
    lines: Vec<String>,
    key_width: usize,
}

impl Default for HumanLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl HumanLayout {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lines: Vec::new(),
            key_width: 18,
        }
    }

    pub fn title(&mut self, text: &str) -> &mut Self {
        self.lines.push(text.bold().to_string());
        self.lines.push(String::new());
        self
    }

    pub fn section(&mut self, text: &str) -> &mut Self {
        self.lines.push(text.bold().to_string());
        self.lines.push("-".repeat(text.len().max(3)));
        self
    }

    pub fn kv(&mut self, key: &str, value: &str) -> &mut Self {
        self.lines.push(format!(
            "{:width$} {value}",
            key.dimmed(),
            width = self.key_width
        ));
        self
    }

    pub fn bullet(&mut self, text: &str) -> &mut Self {
        self.lines.push(format!("- {text}"));
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.lines.push(String::new());
        self
    }

    #[must_use]
    pub fn build(self) -> String {
        self.lines.join("\n")
    }
}

pub fn emit_human(layout: HumanLayout) {
    println!("{}", layout.build());
}

#[must_use]
pub fn describe_action(action: &Action) -> String {
    match action {
        Action::Push { created: true } => "push (create)".to_string(),
        Action::Push { created: false } => "push".to_string(),
        Action::Pull { created: true } => "pull (create)".to_string(),
        Action::Pull { created: false } => "pull".to_string(),
        Action::ResolveConflict {
            resolution: Resolution::PushLocal,
        } => "conflict, kept local".to_string(),
        Action::ResolveConflict {
            resolution: Resolution::PullRemote,
        } => "conflict, took remote".to_string(),
        Action::DeferConflict => "conflict deferred".to_string(),
        Action::RemoteDeleted => "remote deleted".to_string(),
        Action::Unlink => "unlinked".to_string(),
        Action::CloseOrphan => "closed orphan".to_string(),
        Action::Skip => "skipped".to_string(),
    }
}

fn outcome_line(outcome: &EntityOutcome) -> String {
    let marker = match outcome.state {
        EntityState::Committed => "ok".green().to_string(),
        EntityState::Planned => "plan".cyan().to_string(),
        EntityState::Failed => "FAIL".red().bold().to_string(),
    };
    let mut line = format!("{marker} {} {}", outcome.entity_id, describe_action(&outcome.action));
    if let Some(remote_id) = &outcome.remote_id {
        line.push_str(&format!(" -> {remote_id}"));
    }
    if outcome.retries > 0 {
        line.push_str(&format!(" ({} retries)", outcome.retries));
    }
    if let Some(error) = &outcome.error {
        line.push_str(&format!(": [{}] {}", error.kind, error.message));
    }
    line
}

#[must_use]
pub fn render_report(report: &SyncReport) -> HumanLayout {
    let mut layout = HumanLayout::new();
    let title = if report.dry_run {
        format!("Sync plan ({})", report.backend)
    } else {
        format!("Sync report ({})", report.backend)
    };
    layout.title(&title);

    if let Some(error) = &report.run_error {
        layout.kv("run error", &format!("[{}] {}", error.kind, error.message).red().to_string());
    }
    layout
        .kv("pushed", &report.pushed.to_string())
        .kv("pulled", &report.pulled.to_string())
        .kv("conflicts resolved", &report.conflicts_resolved.to_string())
        .kv("conflicts deferred", &report.conflicts_deferred.to_string())
        .kv("orphans closed", &report.orphans_closed.to_string())
        .kv("errors", &report.errors.to_string())
        .kv("retries", &report.retries.to_string());
    if report.cancelled {
        layout.kv("cancelled", &"yes".yellow().to_string());
    }

    if report.is_empty() {
        layout.blank().bullet("Everything up to date");
        return layout;
    }
    if !report.outcomes.is_empty() {
        layout.blank().section("Entities");
        for outcome in &report.outcomes {
            layout.bullet(&outcome_line(outcome));
        }
    }
    layout
}
