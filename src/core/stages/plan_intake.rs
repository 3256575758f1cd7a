//! plan-intake: produce the intake questionnaire and suspend the pipeline
//! until the user submits answers.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{map_llm_error, StageContext, StageHandler};
use crate::core::agents::InterviewerAgent;
use crate::core::error::StageError;
use crate::core::message::{EventDetails, Stage, StageMessage, StatusEvent};
use crate::core::storage::JobPaths;
use crate::core::telemetry::StageTimer;

pub struct PlanIntakeStage;

#[async_trait]
impl StageHandler for PlanIntakeStage {
    fn stage(&self) -> Stage {
        Stage::PlanIntake
    }

    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError> {
        let paths = JobPaths::new(&msg.owner_id, &msg.job_id);
        let title = msg
            .extra_str("title")
            .ok_or_else(|| StageError::validation("plan-intake message is missing title"))?
            .to_string();
        let audience = msg.extra_str("audience").unwrap_or_default().to_string();
        let cycles = ctx.cycles(msg).await;

        let timer = StageTimer::start("PLAN_INTAKE", None);
        let interviewer = InterviewerAgent::new(ctx.gateway.clone());
        let (questions, usage) = interviewer
            .propose_questions(&title)
            .await
            .map_err(map_llm_error)?;

        let questions_blob = paths.intake("questions.json");
        ctx.store
            .put_json(&questions_blob, &questions)
            .await
            .map_err(StageError::from)?;

        let sample_answers: BTreeMap<&str, &str> = questions
            .iter()
            .map(|q| (q.id.as_str(), q.sample.as_str()))
            .collect();
        ctx.store
            .put_json(&paths.intake("sample_answers.json"), &sample_answers)
            .await
            .map_err(StageError::from)?;

        let context_snapshot = serde_json::json!({
            "job_id": msg.job_id,
            "owner_id": msg.owner_id,
            "title": title,
            "audience": audience,
            "cycles_requested": cycles.requested,
        });
        ctx.store
            .put_json(&paths.intake("context.json"), &context_snapshot)
            .await
            .map_err(StageError::from)?;

        let duration_s = timer.finish(ctx.store.as_ref(), &paths).await;
        let details = EventDetails {
            duration_s: Some(duration_s),
            tokens: Some(usage.total_tokens),
            model: Some(ctx.settings.planner_model.clone()),
            notes: Some("upload answers.json and resume".to_string()),
            ..Default::default()
        }
        .with_cycles(cycles, None);
        ctx.publish(&StatusEvent::done(msg, details, Some(questions_blob)));
        // The pipeline stays suspended until submit_answers enqueues
        // intake-resume.
        Ok(())
    }
}
