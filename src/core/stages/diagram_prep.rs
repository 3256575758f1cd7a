//! diagram-prep: extract PlantUML blocks from the drafts, persist the
//! sources and the manifest, and fan out one render message per diagram.
//! Zero diagrams skips the render stage entirely.

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::{StageContext, StageHandler};
use crate::core::diagram::{diagram_name_from_source, DiagramEntry, DiagramManifest};
use crate::core::error::StageError;
use crate::core::markdown::extract_diagram_blocks;
use crate::core::message::{DiagramRequest, EventDetails, Stage, StageMessage, StatusEvent};
use crate::core::storage::{JobPaths, ObjectStore};
use crate::core::telemetry::StageTimer;

pub struct DiagramPrepStage;

#[async_trait]
impl StageHandler for DiagramPrepStage {
    fn stage(&self) -> Stage {
        Stage::DiagramPrep
    }

    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError> {
        let paths = JobPaths::new(&msg.owner_id, &msg.job_id);
        let timer = StageTimer::start("DIAGRAM_PREP", None);
        let plan = ctx.load_plan(&paths).await?;
        let document = ctx.load_document(&paths, &plan).await?;

        let format = ctx.settings.diagram_format.clone();
        let mut manifest = DiagramManifest::default();
        let mut used_names = BTreeSet::new();
        for (idx, block) in extract_diagram_blocks(&document).into_iter().enumerate() {
            let mut name = diagram_name_from_source(&block.source)
                .unwrap_or_else(|| format!("diagram-{}", idx + 1));
            while !used_names.insert(name.clone()) {
                name = format!("{name}-{}", idx + 1);
            }
            manifest.diagrams.push(DiagramEntry {
                source_path: paths.diagram_source(&name),
                asset_path: paths.diagram_asset(&name, &format),
                code_block: block.block,
                format: format.clone(),
                name,
            });
            let entry = manifest.diagrams.last().unwrap();
            ctx.store
                .put_text(&entry.source_path, &block.source)
                .await
                .map_err(StageError::from)?;
        }

        ctx.store
            .put_json(&paths.diagram_index(), &manifest)
            .await
            .map_err(StageError::from)?;

        let cycles = ctx.cycles(msg).await;
        if manifest.is_empty() {
            // Nothing to render.
            ctx.enqueue(&msg.forward(Stage::Finalize).with_cycles(cycles), None)
                .await?;
        } else {
            for entry in &manifest.diagrams {
                let mut render = msg.forward(Stage::DiagramRender).with_cycles(cycles);
                render.diagram = Some(DiagramRequest {
                    name: entry.name.clone(),
                    format: entry.format.clone(),
                    source_path: entry.source_path.clone(),
                    asset_path: entry.asset_path.clone(),
                });
                ctx.enqueue(&render, None).await?;
            }
        }

        let duration_s = timer.finish(ctx.store.as_ref(), &paths).await;
        let details = EventDetails {
            duration_s: Some(duration_s),
            tokens: Some(0),
            notes: Some(format!("{} diagram(s) queued", manifest.len())),
            ..Default::default()
        }
        .with_cycles(cycles, None);
        ctx.publish(&StatusEvent::done(msg, details, Some(paths.diagram_index())));
        Ok(())
    }
}
