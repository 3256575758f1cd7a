//! intake-resume: merge the submitted answers with the job context and
//! wake the pipeline up again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{AnswerMap, StageContext, StageHandler};
use crate::core::agents::IntakeQuestion;
use crate::core::error::StageError;
use crate::core::message::{EventDetails, Stage, StageMessage, StatusEvent};
use crate::core::storage::{JobPaths, ObjectStore};
use crate::core::telemetry::StageTimer;

/// The authoritative planner input. The merge is deterministic: identical
/// answers always produce byte-identical context (no timestamps).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntakeContext {
    pub job_id: String,
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub audience: String,
    pub cycles_requested: u32,
    #[serde(default)]
    pub answers: AnswerMap,
}

pub struct IntakeResumeStage;

#[async_trait]
impl StageHandler for IntakeResumeStage {
    fn stage(&self) -> Stage {
        Stage::IntakeResume
    }

    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError> {
        let paths = JobPaths::new(&msg.owner_id, &msg.job_id);
        let timer = StageTimer::start("INTAKE_RESUME", None);

        let snapshot: serde_json::Value = ctx
            .store
            .get_json(&paths.intake("context.json"))
            .await
            .map_err(|e| StageError::durable(format!("intake context missing: {e:#}")))?;
        let title = snapshot
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let audience = snapshot
            .get("audience")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Absent answers are fine; the planner falls back to samples.
        let answers: AnswerMap = match ctx.store.exists(&paths.intake("answers.json")).await {
            Ok(true) => ctx
                .store
                .get_json(&paths.intake("answers.json"))
                .await
                .map_err(StageError::from)?,
            _ => AnswerMap::new(),
        };

        // Unknown answer keys are kept but flagged.
        if let Ok(true) = ctx.store.exists(&paths.intake("questions.json")).await {
            let questions: Vec<IntakeQuestion> = ctx
                .store
                .get_json(&paths.intake("questions.json"))
                .await
                .unwrap_or_default();
            let known: Vec<&str> = questions.iter().map(|q| q.id.as_str()).collect();
            for key in answers.keys() {
                if !known.contains(&key.as_str()) && !is_builtin_key(key) {
                    warn!(job_id = %msg.job_id, key, "answer key not in questionnaire");
                }
            }
        }

        let cycles = ctx.cycles(msg).await;
        let context = IntakeContext {
            job_id: msg.job_id.clone(),
            owner_id: msg.owner_id.clone(),
            title,
            audience,
            cycles_requested: cycles.requested,
            answers,
        };
        ctx.store
            .put_json(&paths.intake("context.json"), &context)
            .await
            .map_err(StageError::from)?;

        ctx.enqueue(&msg.forward(Stage::Plan).with_cycles(cycles), None)
            .await?;

        let duration_s = timer.finish(ctx.store.as_ref(), &paths).await;
        let details = EventDetails {
            duration_s: Some(duration_s),
            tokens: Some(0),
            ..Default::default()
        }
        .with_cycles(cycles, None);
        ctx.publish(&StatusEvent::done(
            msg,
            details,
            Some(paths.intake("context.json")),
        ));
        Ok(())
    }
}

/// Answer keys the merge itself understands even when the model never asked.
fn is_builtin_key(key: &str) -> bool {
    matches!(
        key,
        "title" | "audience" | "length_pages" | "tone" | "pov" | "structure" | "constraints"
    )
}
