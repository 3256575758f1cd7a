//! Environment-derived configuration for the kernel.
//!
//! Every knob has a default so the kernel runs against local infrastructure
//! (in-memory broker, filesystem object store, SQLite status store) with no
//! environment at all. Secrets are supplied out-of-band via env vars.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::core::message::Stage;

fn coerce_bool(value: Option<String>, default: bool) -> bool {
    match value {
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn coerce_u32(value: Option<String>, default: u32) -> u32 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn coerce_u64(value: Option<String>, default: u64) -> u64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_or(map: &HashMap<String, String>, key: &str, default: &str) -> String {
    map.get(key).cloned().unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone)]
pub struct Settings {
    // Model selection per agent role
    pub planner_model: String,
    pub writer_model: String,
    pub reviewer_model: String,
    pub default_length_pages: u32,

    // LLM endpoint
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_api_version: Option<String>,
    pub request_timeout_s: u64,
    pub max_transient_retries: u32,

    // Broker
    pub broker_connection: Option<String>,
    pub queue_plan_intake: String,
    pub queue_intake_resume: String,
    pub queue_plan: String,
    pub queue_write: String,
    pub queue_review: String,
    pub queue_review_style: String,
    pub queue_review_cohesion: String,
    pub queue_review_summary: String,
    pub queue_verify: String,
    pub queue_rewrite: String,
    pub queue_diagram_prep: String,
    pub queue_diagram_render: String,
    pub queue_finalize_ready: String,
    pub topic_status: String,
    pub status_subscription: String,
    pub lock_duration_s: u64,
    pub max_delivery_count: u32,
    /// Base of the redelivery backoff (doubled per delivery, capped at 60s).
    pub redelivery_base_ms: u64,

    // Object store + status store
    pub store_root: PathBuf,
    pub status_db_path: PathBuf,

    // Pipeline behavior
    pub write_batch_size: usize,
    pub write_retry_delay_s: u64,
    pub review_style_enabled: bool,
    pub review_cohesion_enabled: bool,
    pub review_summary_enabled: bool,
    pub timeline_cap: usize,

    // Diagram renderer (external HTTP service)
    pub plantuml_server_url: Option<String>,
    pub diagram_format: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_map(&HashMap::new())
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_map(&env::vars().collect())
    }

    pub fn from_map(env: &HashMap<String, String>) -> Self {
        Self {
            planner_model: env_or(env, "DOCWRITER_PLANNER_MODEL", "gpt-5.2"),
            writer_model: env_or(env, "DOCWRITER_WRITER_MODEL", "gpt-5.2"),
            reviewer_model: env_or(env, "DOCWRITER_REVIEWER_MODEL", "gpt-5.2"),
            default_length_pages: coerce_u32(
                env.get("DOCWRITER_DEFAULT_LENGTH_PAGES").cloned(),
                80,
            ),
            llm_base_url: env.get("DOCWRITER_LLM_BASE_URL").cloned(),
            llm_api_key: env.get("DOCWRITER_LLM_API_KEY").cloned(),
            llm_api_version: env.get("DOCWRITER_LLM_API_VERSION").cloned(),
            request_timeout_s: coerce_u64(env.get("DOCWRITER_REQUEST_TIMEOUT_S").cloned(), 120),
            max_transient_retries: coerce_u32(
                env.get("DOCWRITER_MAX_TRANSIENT_RETRIES").cloned(),
                3,
            ),
            broker_connection: env.get("DOCWRITER_BROKER_CONNECTION").cloned(),
            queue_plan_intake: env_or(env, "DOCWRITER_QUEUE_PLAN_INTAKE", "docwriter-plan-intake"),
            queue_intake_resume: env_or(
                env,
                "DOCWRITER_QUEUE_INTAKE_RESUME",
                "docwriter-intake-resume",
            ),
            queue_plan: env_or(env, "DOCWRITER_QUEUE_PLAN", "docwriter-plan"),
            queue_write: env_or(env, "DOCWRITER_QUEUE_WRITE", "docwriter-write"),
            queue_review: env_or(env, "DOCWRITER_QUEUE_REVIEW", "docwriter-review"),
            queue_review_style: env_or(
                env,
                "DOCWRITER_QUEUE_REVIEW_STYLE",
                "docwriter-review-style",
            ),
            queue_review_cohesion: env_or(
                env,
                "DOCWRITER_QUEUE_REVIEW_COHESION",
                "docwriter-review-cohesion",
            ),
            queue_review_summary: env_or(
                env,
                "DOCWRITER_QUEUE_REVIEW_SUMMARY",
                "docwriter-review-summary",
            ),
            queue_verify: env_or(env, "DOCWRITER_QUEUE_VERIFY", "docwriter-verify"),
            queue_rewrite: env_or(env, "DOCWRITER_QUEUE_REWRITE", "docwriter-rewrite"),
            queue_diagram_prep: env_or(
                env,
                "DOCWRITER_QUEUE_DIAGRAM_PREP",
                "docwriter-diagram-prep",
            ),
            queue_diagram_render: env_or(
                env,
                "DOCWRITER_QUEUE_DIAGRAM_RENDER",
                "docwriter-diagram-render",
            ),
            queue_finalize_ready: env_or(
                env,
                "DOCWRITER_QUEUE_FINALIZE_READY",
                "docwriter-finalize-ready",
            ),
            topic_status: env_or(env, "DOCWRITER_TOPIC_STATUS", "docwriter-status"),
            status_subscription: env_or(env, "DOCWRITER_STATUS_SUBSCRIPTION", "status-writer"),
            lock_duration_s: coerce_u64(env.get("DOCWRITER_LOCK_DURATION_S").cloned(), 300),
            max_delivery_count: coerce_u32(env.get("DOCWRITER_MAX_DELIVERY_COUNT").cloned(), 10),
            redelivery_base_ms: coerce_u64(env.get("DOCWRITER_REDELIVERY_BASE_MS").cloned(), 1000),
            store_root: PathBuf::from(env_or(env, "DOCWRITER_STORE_ROOT", "./docwriter-data")),
            status_db_path: PathBuf::from(env_or(
                env,
                "DOCWRITER_STATUS_DB",
                "./docwriter-data/status.db",
            )),
            write_batch_size: coerce_u32(env.get("DOCWRITER_WRITE_BATCH_SIZE").cloned(), 5)
                .max(1) as usize,
            write_retry_delay_s: coerce_u64(env.get("DOCWRITER_WRITE_RETRY_DELAY_S").cloned(), 5),
            review_style_enabled: coerce_bool(
                env.get("DOCWRITER_REVIEW_STYLE_ENABLED").cloned(),
                true,
            ),
            review_cohesion_enabled: coerce_bool(
                env.get("DOCWRITER_REVIEW_COHESION_ENABLED").cloned(),
                true,
            ),
            review_summary_enabled: coerce_bool(
                env.get("DOCWRITER_REVIEW_SUMMARY_ENABLED").cloned(),
                true,
            ),
            timeline_cap: coerce_u32(env.get("DOCWRITER_TIMELINE_CAP").cloned(), 10_000) as usize,
            plantuml_server_url: env.get("PLANTUML_SERVER_URL").cloned(),
            diagram_format: {
                let fmt = env_or(env, "DOCWRITER_DIAGRAM_FORMAT", "png").to_lowercase();
                if fmt == "svg" { fmt } else { "png".to_string() }
            },
        }
    }

    /// Queue name for a stage's input queue.
    pub fn queue_for(&self, stage: Stage) -> &str {
        match stage {
            Stage::PlanIntake => &self.queue_plan_intake,
            Stage::IntakeResume => &self.queue_intake_resume,
            Stage::Plan => &self.queue_plan,
            Stage::Write => &self.queue_write,
            Stage::Review => &self.queue_review,
            Stage::Verify => &self.queue_verify,
            Stage::Rewrite => &self.queue_rewrite,
            Stage::DiagramPrep => &self.queue_diagram_prep,
            Stage::DiagramRender => &self.queue_diagram_render,
            Stage::Finalize => &self.queue_finalize_ready,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let s = Settings::from_map(&HashMap::new());
        assert_eq!(s.queue_plan_intake, "docwriter-plan-intake");
        assert_eq!(s.topic_status, "docwriter-status");
        assert_eq!(s.default_length_pages, 80);
        assert_eq!(s.max_delivery_count, 10);
        assert!(s.review_style_enabled);
        assert_eq!(s.diagram_format, "png");
    }

    #[test]
    fn env_overrides_and_coercion() {
        let mut env = HashMap::new();
        env.insert("DOCWRITER_WRITE_BATCH_SIZE".into(), "3".into());
        env.insert("DOCWRITER_REVIEW_STYLE_ENABLED".into(), "off".into());
        env.insert("DOCWRITER_DEFAULT_LENGTH_PAGES".into(), "not-a-number".into());
        env.insert("DOCWRITER_DIAGRAM_FORMAT".into(), "SVG".into());
        let s = Settings::from_map(&env);
        assert_eq!(s.write_batch_size, 3);
        assert!(!s.review_style_enabled);
        assert_eq!(s.default_length_pages, 80);
        assert_eq!(s.diagram_format, "svg");
    }

    #[test]
    fn batch_size_floor_is_one() {
        let mut env = HashMap::new();
        env.insert("DOCWRITER_WRITE_BATCH_SIZE".into(), "0".into());
        let s = Settings::from_map(&env);
        assert_eq!(s.write_batch_size, 1);
    }
}
