//! plan: turn the intake context into a validated section DAG and fan the
//! write work out.

use async_trait::async_trait;

use super::{IntakeContext, StageContext, StageHandler};
use crate::core::agents::{PlannerAgent, PlannerError};
use crate::core::error::StageError;
use crate::core::message::{EventDetails, Stage, StageMessage, StatusEvent};
use crate::core::plan::DependencyGraph;
use crate::core::storage::JobPaths;
use crate::core::telemetry::StageTimer;

pub struct PlanStage;

#[async_trait]
impl StageHandler for PlanStage {
    fn stage(&self) -> Stage {
        Stage::Plan
    }

    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError> {
        let paths = JobPaths::new(&msg.owner_id, &msg.job_id);
        let timer = StageTimer::start("PLAN", None);

        let context: IntakeContext = ctx
            .store
            .get_json(&paths.intake("context.json"))
            .await
            .map_err(|e| StageError::durable(format!("intake context missing: {e:#}")))?;

        let length_pages = context
            .answers
            .get("length_pages")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(ctx.settings.default_length_pages);

        let planner = PlannerAgent::new(ctx.gateway.clone());
        let (mut plan, tokens) = planner
            .plan(&context.title, &context.audience, length_pages)
            .await
            .map_err(|e| match e {
                PlannerError::Llm(inner) => super::map_llm_error(inner),
                PlannerError::Invalid(reason) => StageError::validation(reason),
            })?;

        // Intake answers override the planner's style choices.
        let style = &mut plan.global_style;
        for (key, slot) in [
            ("tone", &mut style.tone),
            ("pov", &mut style.pov),
            ("structure", &mut style.structure),
            ("constraints", &mut style.constraints),
        ] {
            if let Some(value) = context.answers.get(key) {
                if !value.trim().is_empty() {
                    *slot = Some(value.clone());
                }
            }
        }

        ctx.store
            .put_json(&paths.plan(), &plan)
            .await
            .map_err(StageError::from)?;

        // One write message per batch of sections, in topological order. The
        // dependency-ready check in the write worker enforces actual ordering.
        let order = DependencyGraph::from_sections(&plan.sections)
            .topological_order()
            .map_err(|e| StageError::logic(e.to_string()))?;
        let cycles = ctx.cycles(msg).await;
        for batch in order.chunks(ctx.settings.write_batch_size) {
            let write_msg = msg
                .forward(Stage::Write)
                .with_cycles(cycles)
                .with_sections(batch.to_vec())
                .with_input("plan", &paths.plan());
            ctx.enqueue(&write_msg, None).await?;
        }

        let duration_s = timer.finish(ctx.store.as_ref(), &paths).await;
        let details = EventDetails {
            duration_s: Some(duration_s),
            tokens: Some(tokens),
            model: Some(ctx.settings.planner_model.clone()),
            ..Default::default()
        }
        .with_cycles(cycles, None);
        ctx.publish(&StatusEvent::done(msg, details, Some(paths.plan())));
        Ok(())
    }
}
