//! review: fan the enabled reviewer flavors out over the assembled draft and
//! persist one note per flavor for the cycle.

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::info;

use super::{map_llm_error, StageContext, StageHandler};
use crate::core::agents::{enabled_flavors, ReviewerAgent, ReviewerFlavor};
use crate::core::error::StageError;
use crate::core::message::{EventDetails, Stage, StageMessage, StatusEvent};
use crate::core::storage::JobPaths;
use crate::core::telemetry::StageTimer;

pub struct ReviewStage;

#[async_trait]
impl StageHandler for ReviewStage {
    fn stage(&self) -> Stage {
        Stage::Review
    }

    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError> {
        let paths = JobPaths::new(&msg.owner_id, &msg.job_id);
        let cycles = ctx.cycles(msg).await;

        // Cycle budget spent: skip straight to the diagram pipeline.
        if cycles.exhausted() {
            info!(
                job_id = %msg.job_id,
                requested = cycles.requested,
                "cycle budget exhausted, skipping review"
            );
            ctx.enqueue(&msg.forward(Stage::DiagramPrep).with_cycles(cycles), None)
                .await?;
            return Ok(());
        }
        let cycle_idx = cycles.current_index();

        let plan = ctx.load_plan(&paths).await?;
        let document = ctx.load_document(&paths, &plan).await?;
        let timer = StageTimer::start("REVIEW", Some(cycle_idx));

        let mut join_set = JoinSet::new();
        for flavor in enabled_flavors(&ctx.settings) {
            let gateway = ctx.gateway.clone();
            let plan = plan.clone();
            let document = document.clone();
            join_set.spawn(async move {
                let agent = ReviewerAgent::new(gateway);
                let note = agent.review(flavor, &plan, &document).await;
                (flavor, note)
            });
        }

        let mut tokens_total = 0u64;
        while let Some(result) = join_set.join_next().await {
            let (flavor, note) = result
                .map_err(|e| StageError::durable(format!("review task panicked: {e}")))?;
            let note = note.map_err(map_llm_error)?;
            tokens_total += note.tokens_used;
            ctx.store
                .put_json(&paths.review(cycle_idx, &flavor.artifact_name()), &note)
                .await
                .map_err(StageError::from)?;
        }

        ctx.enqueue(
            &msg.forward(Stage::Verify)
                .with_cycle(cycle_idx)
                .with_cycles(cycles),
            None,
        )
        .await?;

        let duration_s = timer.finish(ctx.store.as_ref(), &paths).await;
        let details = EventDetails {
            duration_s: Some(duration_s),
            tokens: Some(tokens_total),
            model: Some(ctx.settings.reviewer_model.clone()),
            ..Default::default()
        }
        .with_cycles(cycles, Some(cycle_idx));
        ctx.publish(&StatusEvent::done(
            msg,
            details,
            Some(paths.review(cycle_idx, &ReviewerFlavor::General.artifact_name())),
        ));
        Ok(())
    }
}
