//! Message contracts: stage messages on queues and status events on the topic.
//!
//! Unknown fields are preserved when a message is forwarded (forward
//! compatibility) via the flattened `extra` map on both envelopes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::error::StageError;

/// Current unix time as fractional seconds.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

// --- Stages ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    PlanIntake,
    IntakeResume,
    Plan,
    Write,
    Review,
    Verify,
    Rewrite,
    DiagramPrep,
    DiagramRender,
    Finalize,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::PlanIntake => "plan-intake",
            Stage::IntakeResume => "intake-resume",
            Stage::Plan => "plan",
            Stage::Write => "write",
            Stage::Review => "review",
            Stage::Verify => "verify",
            Stage::Rewrite => "rewrite",
            Stage::DiagramPrep => "diagram-prep",
            Stage::DiagramRender => "diagram-render",
            Stage::Finalize => "finalize",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plan-intake" => Some(Stage::PlanIntake),
            "intake-resume" => Some(Stage::IntakeResume),
            "plan" => Some(Stage::Plan),
            "write" => Some(Stage::Write),
            "review" => Some(Stage::Review),
            "verify" => Some(Stage::Verify),
            "rewrite" => Some(Stage::Rewrite),
            "diagram-prep" => Some(Stage::DiagramPrep),
            "diagram-render" => Some(Stage::DiagramRender),
            "finalize" => Some(Stage::Finalize),
            _ => None,
        }
    }

    /// Upper-snake label used in status event names and timeline rows.
    pub fn event_label(self) -> &'static str {
        match self {
            Stage::PlanIntake => "PLAN_INTAKE",
            Stage::IntakeResume => "INTAKE_RESUME",
            Stage::Plan => "PLAN",
            Stage::Write => "WRITE",
            Stage::Review => "REVIEW",
            Stage::Verify => "VERIFY",
            Stage::Rewrite => "REWRITE",
            Stage::DiagramPrep => "DIAGRAM_PREP",
            Stage::DiagramRender => "DIAGRAM_RENDER",
            Stage::Finalize => "FINALIZE",
        }
    }

    /// Event name for a successful completion. A few stages have historical
    /// names that differ from `{label}_DONE`.
    pub fn done_label(self) -> &'static str {
        match self {
            Stage::PlanIntake => "INTAKE_READY",
            Stage::IntakeResume => "INTAKE_RESUMED",
            Stage::Plan => "PLAN_DONE",
            Stage::Write => "WRITE_DONE",
            Stage::Review => "REVIEW_DONE",
            Stage::Verify => "VERIFY_DONE",
            Stage::Rewrite => "REWRITE_DONE",
            Stage::DiagramPrep => "DIAGRAM_PREP_DONE",
            Stage::DiagramRender => "DIAGRAMS_DONE",
            Stage::Finalize => "FINALIZE_DONE",
        }
    }

    /// Inverse of [`Stage::event_label`].
    pub fn from_event_label(label: &str) -> Option<Self> {
        match label {
            "PLAN_INTAKE" => Some(Stage::PlanIntake),
            "INTAKE_RESUME" => Some(Stage::IntakeResume),
            "PLAN" => Some(Stage::Plan),
            "WRITE" => Some(Stage::Write),
            "REVIEW" => Some(Stage::Review),
            "VERIFY" => Some(Stage::Verify),
            "REWRITE" => Some(Stage::Rewrite),
            "DIAGRAM_PREP" => Some(Stage::DiagramPrep),
            "DIAGRAM_RENDER" => Some(Stage::DiagramRender),
            "FINALIZE" => Some(Stage::Finalize),
            _ => None,
        }
    }

    /// Whether this stage runs once per review cycle.
    pub fn cyclic(self) -> bool {
        matches!(self, Stage::Review | Stage::Verify | Stage::Rewrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Queued,
    Start,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Queued => "QUEUED",
            Phase::Start => "START",
            Phase::Done => "DONE",
            Phase::Failed => "FAILED",
        }
    }
}

// --- Cycle accounting ---

/// Review/verify/rewrite cycle budget carried by messages and re-hydrated
/// from the status store when a forwarded payload dropped the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleState {
    pub requested: u32,
    pub completed: u32,
}

impl CycleState {
    pub fn new(requested: u32, completed: u32) -> Self {
        let requested = requested.clamp(1, 5);
        Self {
            requested,
            completed: completed.min(requested),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.requested - self.completed
    }

    pub fn exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// The 1-based index of the cycle currently in flight.
    pub fn current_index(&self) -> u32 {
        (self.completed + 1).min(self.requested)
    }

    /// Account one finished rewrite pass.
    pub fn consume_rewrite(self) -> Self {
        if self.exhausted() {
            self
        } else {
            Self {
                requested: self.requested,
                completed: self.completed + 1,
            }
        }
    }
}

// --- Stage message envelope ---

/// Request for rendering one diagram, carried by `diagram-render` messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagramRequest {
    pub name: String,
    pub format: String,
    /// Blob path of the `.puml` source within the job root.
    pub source_path: String,
    /// Blob path the rendered asset is written to.
    pub asset_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMessage {
    pub job_id: String,
    pub owner_id: String,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    /// Blob pointers by role (e.g. "plan" -> "jobs/u/j/plan.json").
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub attempt: u32,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles_requested: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles_completed: Option<u32>,
    /// Section ids addressed by a `write` or `rewrite` message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram: Option<DiagramRequest>,
    /// Unknown fields, preserved verbatim when the message is forwarded.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StageMessage {
    pub fn new(job_id: &str, owner_id: &str, stage: Stage) -> Self {
        Self {
            job_id: job_id.to_string(),
            owner_id: owner_id.to_string(),
            stage,
            cycle: None,
            inputs: HashMap::new(),
            attempt: 0,
            trace_id: uuid::Uuid::new_v4().to_string(),
            cycles_requested: None,
            cycles_completed: None,
            sections: Vec::new(),
            diagram: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Derive a message for the next stage, carrying forward identity, cycle
    /// counters, and any unknown fields.
    pub fn forward(&self, stage: Stage) -> Self {
        Self {
            job_id: self.job_id.clone(),
            owner_id: self.owner_id.clone(),
            stage,
            cycle: None,
            inputs: HashMap::new(),
            attempt: 0,
            trace_id: self.trace_id.clone(),
            cycles_requested: self.cycles_requested,
            cycles_completed: self.cycles_completed,
            sections: Vec::new(),
            diagram: None,
            extra: self.extra.clone(),
        }
    }

    pub fn with_cycle(mut self, cycle: u32) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub fn with_cycles(mut self, state: CycleState) -> Self {
        self.cycles_requested = Some(state.requested);
        self.cycles_completed = Some(state.completed);
        self
    }

    pub fn with_sections(mut self, sections: Vec<String>) -> Self {
        self.sections = sections;
        self
    }

    pub fn with_input(mut self, role: &str, blob: &str) -> Self {
        self.inputs.insert(role.to_string(), blob.to_string());
        self
    }

    /// Structural checks every worker performs before touching state.
    pub fn validate(&self, expected: Stage) -> Result<(), StageError> {
        if self.owner_id.trim().is_empty() {
            return Err(StageError::validation("message is missing owner_id"));
        }
        if self.job_id.trim().is_empty() {
            return Err(StageError::validation("message is missing job_id"));
        }
        if self.stage != expected {
            return Err(StageError::validation(format!(
                "message stage {} does not match queue stage {}",
                self.stage.as_str(),
                expected.as_str()
            )));
        }
        Ok(())
    }

    pub fn with_extra(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// Cycle counters from the message, when both are present.
    pub fn cycle_state(&self) -> Option<CycleState> {
        match (self.cycles_requested, self.cycles_completed) {
            (Some(req), Some(done)) => Some(CycleState::new(req, done)),
            _ => None,
        }
    }
}

// --- Status events ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles_requested: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles_completed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_index: Option<u32>,
    /// Structured form of the pipe-format `message`, filled by the recorder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_message: Option<serde_json::Value>,
}

impl EventDetails {
    pub fn is_empty(&self) -> bool {
        *self == EventDetails::default()
    }

    pub fn with_cycles(mut self, state: CycleState, cycle_idx: Option<u32>) -> Self {
        self.cycles_requested = Some(state.requested);
        self.cycles_completed = Some(state.completed);
        self.cycles_remaining = Some(state.remaining());
        self.cycle_index = cycle_idx;
        self
    }
}

/// One stage transition on the status topic; persisted verbatim into the
/// per-job timeline by the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: String,
    pub owner_id: String,
    /// Event name, e.g. `WRITE_DONE`, `REVIEW_START`, `ENQUEUED`.
    pub stage: String,
    pub phase: Phase,
    pub ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "EventDetails::is_empty")]
    pub details: EventDetails,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StatusEvent {
    fn base(job_id: &str, owner_id: &str, stage: String, phase: Phase) -> Self {
        Self {
            job_id: job_id.to_string(),
            owner_id: owner_id.to_string(),
            stage,
            phase,
            ts: unix_now(),
            cycle: None,
            message: None,
            artifact: None,
            details: EventDetails::default(),
            extra: serde_json::Map::new(),
        }
    }

    /// The admission event; emitted once by `admit_job`.
    pub fn enqueued(job_id: &str, owner_id: &str) -> Self {
        let mut ev = Self::base(job_id, owner_id, "ENQUEUED".to_string(), Phase::Queued);
        ev.message = Some("Job submitted".to_string());
        ev
    }

    pub fn queued(msg: &StageMessage) -> Self {
        let mut ev = Self::base(
            &msg.job_id,
            &msg.owner_id,
            format!("{}_QUEUED", msg.stage.event_label()),
            Phase::Queued,
        );
        ev.cycle = msg.cycle;
        ev.message = Some(default_message(&ev.stage, msg.cycle));
        ev
    }

    pub fn started(msg: &StageMessage) -> Self {
        let mut ev = Self::base(
            &msg.job_id,
            &msg.owner_id,
            format!("{}_START", msg.stage.event_label()),
            Phase::Start,
        );
        ev.cycle = msg.cycle;
        ev.message = Some(default_message(&ev.stage, msg.cycle));
        ev
    }

    pub fn done(msg: &StageMessage, details: EventDetails, artifact: Option<String>) -> Self {
        let stage_name = msg.stage.done_label().to_string();
        let mut ev = Self::base(&msg.job_id, &msg.owner_id, stage_name, Phase::Done);
        ev.cycle = msg.cycle;
        ev.message = Some(format_stage_message(
            msg.stage.event_label(),
            artifact.as_deref(),
            details.duration_s,
            details.tokens,
            details.model.as_deref(),
            details.notes.as_deref(),
        ));
        ev.artifact = artifact;
        ev.details = details;
        ev
    }

    pub fn failed(msg: &StageMessage, error_kind: &str, error: &str) -> Self {
        let mut ev = Self::base(
            &msg.job_id,
            &msg.owner_id,
            format!("{}_FAILED", msg.stage.event_label()),
            Phase::Failed,
        );
        ev.cycle = msg.cycle;
        ev.message = Some(error.to_string());
        ev.details.error_kind = Some(error_kind.to_string());
        ev
    }
}

fn default_message(stage: &str, cycle: Option<u32>) -> String {
    let mut words = stage.split('_');
    let mut label = String::new();
    if let Some(first) = words.next() {
        let mut chars = first.chars();
        if let Some(c) = chars.next() {
            label.push_str(&c.to_uppercase().to_string());
            label.push_str(&chars.as_str().to_lowercase());
        }
    }
    for w in words {
        label.push(' ');
        label.push_str(&w.to_lowercase());
    }
    match cycle {
        Some(c) => format!("{label} (cycle {c})"),
        None => label,
    }
}

// --- Human-readable stage message (pipe format) ---

fn format_duration(duration_s: Option<f64>) -> String {
    let Some(d) = duration_s else {
        return "unknown duration".to_string();
    };
    let total = d.max(0.0) as u64;
    let (minutes, seconds) = (total / 60, total % 60);
    match (minutes, seconds) {
        (0, s) => format!("{s} sec"),
        (m, 0) => format!("{m} min"),
        (m, s) => format!("{m} min {s} sec"),
    }
}

fn pretty_stage(label: &str) -> String {
    label
        .split('_')
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().to_string() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the pipe-format summary shown to users and parsed by the recorder.
pub fn format_stage_message(
    stage_label: &str,
    artifact: Option<&str>,
    duration_s: Option<f64>,
    tokens: Option<u64>,
    model: Option<&str>,
    notes: Option<&str>,
) -> String {
    let mut parts = vec![
        format!("stage completed: {}", pretty_stage(stage_label)),
        format!("stage document: {}", artifact.unwrap_or("n/a")),
        format!("stage time: {}", format_duration(duration_s)),
        format!(
            "stage tokens: {}",
            tokens.map(|t| t.to_string()).unwrap_or_else(|| "n/a".into())
        ),
        format!("stage model: {}", model.unwrap_or("n/a")),
    ];
    if let Some(notes) = notes {
        parts.push(format!("stage notes: {notes}"));
    }
    parts.join(" | ")
}

/// Inverse of [`format_stage_message`], tolerant of missing segments.
pub fn parse_stage_message(message: &str) -> Option<serde_json::Value> {
    if message.trim().is_empty() {
        return None;
    }
    let mut out = serde_json::Map::new();
    for part in message.split(" | ") {
        let Some((key, value)) = part.split_once(": ") else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() || value == "n/a" {
            continue;
        }
        let mapped = match key.trim() {
            "stage completed" => "stage_label",
            "stage document" => "document",
            "stage time" => "duration",
            "stage tokens" => "tokens",
            "stage model" => "model",
            "stage notes" => "notes",
            _ => continue,
        };
        if mapped == "tokens" {
            if let Ok(n) = value.replace(',', "").parse::<u64>() {
                out.insert(mapped.to_string(), serde_json::json!(n));
                continue;
            }
        }
        out.insert(mapped.to_string(), serde_json::json!(value));
    }
    if out.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_roundtrip() {
        for stage in [
            Stage::PlanIntake,
            Stage::IntakeResume,
            Stage::Plan,
            Stage::Write,
            Stage::Review,
            Stage::Verify,
            Stage::Rewrite,
            Stage::DiagramPrep,
            Stage::DiagramRender,
            Stage::Finalize,
        ] {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("review-style"), None);
    }

    #[test]
    fn message_preserves_unknown_fields() {
        let raw = r#"{
            "job_id": "j1",
            "owner_id": "u1",
            "stage": "write",
            "trace_id": "t1",
            "sections": ["s1"],
            "shard_hint": 7,
            "origin": "unit-test"
        }"#;
        let msg: StageMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.sections, vec!["s1"]);
        assert_eq!(msg.extra.get("shard_hint"), Some(&serde_json::json!(7)));

        let forwarded = msg.forward(Stage::Review);
        let encoded = serde_json::to_value(&forwarded).unwrap();
        assert_eq!(encoded["origin"], "unit-test");
        assert_eq!(encoded["shard_hint"], 7);
        assert_eq!(encoded["stage"], "review");
    }

    #[test]
    fn message_without_owner_fails_validation() {
        let raw = r#"{"job_id": "j1", "owner_id": "  ", "stage": "plan", "trace_id": "t"}"#;
        let msg: StageMessage = serde_json::from_str(raw).unwrap();
        let err = msg.validate(Stage::Plan).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn message_stage_queue_mismatch() {
        let msg = StageMessage::new("j", "u", Stage::Plan);
        assert!(msg.validate(Stage::Write).is_err());
        assert!(msg.validate(Stage::Plan).is_ok());
    }

    #[test]
    fn cycle_state_bounds() {
        let c = CycleState::new(9, 0);
        assert_eq!(c.requested, 5);
        let c = CycleState::new(2, 5);
        assert_eq!(c.completed, 2);
        assert!(c.exhausted());
        assert_eq!(c.consume_rewrite(), c);

        let c = CycleState::new(2, 0);
        assert_eq!(c.current_index(), 1);
        let c = c.consume_rewrite();
        assert_eq!(c.completed, 1);
        assert_eq!(c.current_index(), 2);
    }

    #[test]
    fn pipe_message_roundtrip() {
        let msg = format_stage_message(
            "PLAN",
            Some("jobs/u/j/plan.json"),
            Some(65.0),
            Some(1234),
            Some("gpt-5.2"),
            Some("contradictions detected"),
        );
        assert!(msg.starts_with("stage completed: Plan | "));
        let parsed = parse_stage_message(&msg).unwrap();
        assert_eq!(parsed["document"], "jobs/u/j/plan.json");
        assert_eq!(parsed["duration"], "1 min 5 sec");
        assert_eq!(parsed["tokens"], 1234);
        assert_eq!(parsed["model"], "gpt-5.2");
        assert_eq!(parsed["notes"], "contradictions detected");
    }

    #[test]
    fn parse_stage_message_tolerates_plain_text() {
        assert!(parse_stage_message("Review done (cycle 2)").is_none());
        assert!(parse_stage_message("").is_none());
    }

    #[test]
    fn done_labels() {
        assert_eq!(Stage::PlanIntake.done_label(), "INTAKE_READY");
        assert_eq!(Stage::IntakeResume.done_label(), "INTAKE_RESUMED");
        assert_eq!(Stage::DiagramRender.done_label(), "DIAGRAMS_DONE");
        assert_eq!(Stage::Finalize.done_label(), "FINALIZE_DONE");
    }
}
