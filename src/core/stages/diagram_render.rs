//! diagram-render: render one diagram via the external PlantUML service.
//! The worker that observes the last manifest entry rendered enqueues
//! finalize; the decision rides on an atomic counter in the status store.

use async_trait::async_trait;
use tracing::debug;

use super::{StageContext, StageHandler};
use crate::core::diagram::{DiagramManifest, RenderError};
use crate::core::error::StageError;
use crate::core::message::{EventDetails, Stage, StageMessage, StatusEvent};
use crate::core::storage::{JobPaths, ObjectStore};
use crate::core::telemetry::StageTimer;

pub struct DiagramRenderStage;

#[async_trait]
impl StageHandler for DiagramRenderStage {
    fn stage(&self) -> Stage {
        Stage::DiagramRender
    }

    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError> {
        let request = msg
            .diagram
            .as_ref()
            .ok_or_else(|| StageError::validation("diagram-render message has no request"))?;
        let paths = JobPaths::new(&msg.owner_id, &msg.job_id);
        let timer = StageTimer::start("DIAGRAM_RENDER", None);

        let already_rendered = ctx
            .store
            .exists(&request.asset_path)
            .await
            .map_err(StageError::from)?;
        if !already_rendered {
            let renderer = ctx
                .renderer
                .as_ref()
                .ok_or_else(|| StageError::durable("diagram renderer not configured"))?;
            let source = ctx
                .store
                .get_text(&request.source_path)
                .await
                .map_err(|e| StageError::durable(format!("diagram source missing: {e:#}")))?;
            let bytes = renderer
                .render(&source, &request.format)
                .await
                .map_err(|e| match e {
                    RenderError::Transient(reason) => StageError::transient(reason),
                    other => StageError::durable(other),
                })?;
            ctx.store
                .put_bytes(&request.asset_path, &bytes)
                .await
                .map_err(StageError::from)?;
        } else {
            debug!(job_id = %msg.job_id, diagram = %request.name, "asset exists, skipping render");
        }

        let manifest: DiagramManifest = ctx
            .store
            .get_json(&paths.diagram_index())
            .await
            .map_err(|e| StageError::durable(format!("diagram manifest missing: {e:#}")))?;
        let (_, rendered) = ctx
            .status
            .record_completion(&msg.job_id, "diagram", &request.name)
            .await
            .map_err(StageError::from)?;

        let duration_s = timer.finish(ctx.store.as_ref(), &paths).await;
        if rendered as usize == manifest.len() {
            let cycles = ctx.cycles(msg).await;
            ctx.enqueue(&msg.forward(Stage::Finalize).with_cycles(cycles), None)
                .await?;
            let details = EventDetails {
                duration_s: Some(duration_s),
                tokens: Some(0),
                notes: Some(format!("{rendered} diagram(s) rendered")),
                ..Default::default()
            }
            .with_cycles(cycles, None);
            ctx.publish(&StatusEvent::done(msg, details, Some(paths.diagram_index())));
        }
        Ok(())
    }
}
