//! finalize: assemble the terminal artifact set. Sections are concatenated
//! in plan order, diagram blocks give way to image references per the
//! manifest, and the converter seam produces PDF/DOCX when wired in.

use async_trait::async_trait;
use tracing::warn;

use super::{read_optional_json, StageContext, StageHandler};
use crate::core::artifacts::build_diagram_archive;
use crate::core::diagram::DiagramManifest;
use crate::core::error::StageError;
use crate::core::markdown::{build_title_page, insert_table_of_contents, number_headings};
use crate::core::message::{EventDetails, Stage, StageMessage, StatusEvent};
use crate::core::storage::{JobPaths, ObjectStore};
use crate::core::telemetry::StageTimer;

pub struct FinalizeStage;

#[async_trait]
impl StageHandler for FinalizeStage {
    fn stage(&self) -> Stage {
        Stage::Finalize
    }

    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError> {
        let paths = JobPaths::new(&msg.owner_id, &msg.job_id);
        let timer = StageTimer::start("FINALIZE", None);
        let plan = ctx.load_plan(&paths).await?;
        let body = ctx.load_document(&paths, &plan).await?;

        let manifest: DiagramManifest = read_optional_json(ctx, &paths.diagram_index())
            .await?
            .unwrap_or_default();
        let mut document = format!(
            "{}{}",
            build_title_page(&plan.title, &plan.audience, &msg.job_id),
            body
        );
        for entry in &manifest.diagrams {
            let relative = entry
                .asset_path
                .strip_prefix(&format!("{}/", paths.root()))
                .unwrap_or(&entry.asset_path);
            let image = format!("![{}]({})", entry.name, relative);
            if document.contains(&entry.code_block) {
                document = document.replacen(&entry.code_block, &image, 1);
            } else {
                warn!(job_id = %msg.job_id, diagram = %entry.name, "diagram block not found in drafts");
            }
        }
        document = number_headings(&document);
        document = insert_table_of_contents(&document);

        let final_md = paths.final_artifact("md");
        ctx.store
            .put_text(&final_md, &document)
            .await
            .map_err(StageError::from)?;

        // PDF/DOCX conversion is an external collaborator; absence or
        // failure degrades to Markdown-only output.
        match &ctx.converter {
            Some(converter) => {
                match converter.to_pdf(&document).await {
                    Ok(bytes) => ctx
                        .store
                        .put_bytes(&paths.final_artifact("pdf"), &bytes)
                        .await
                        .map_err(StageError::from)?,
                    Err(err) => warn!(job_id = %msg.job_id, "pdf export failed: {err:#}"),
                }
                match converter.to_docx(&document).await {
                    Ok(bytes) => ctx
                        .store
                        .put_bytes(&paths.final_artifact("docx"), &bytes)
                        .await
                        .map_err(StageError::from)?,
                    Err(err) => warn!(job_id = %msg.job_id, "docx export failed: {err:#}"),
                }
            }
            None => warn!(job_id = %msg.job_id, "no document converter wired, skipping pdf/docx"),
        }

        let archive = build_diagram_archive(ctx.store.as_ref(), &paths)
            .await
            .map_err(StageError::from)?;
        ctx.store
            .put_bytes(&paths.diagram_archive(), &archive)
            .await
            .map_err(StageError::from)?;

        let cycles = ctx.cycles(msg).await;
        let duration_s = timer.finish(ctx.store.as_ref(), &paths).await;
        let details = EventDetails {
            duration_s: Some(duration_s),
            tokens: Some(0),
            ..Default::default()
        }
        .with_cycles(cycles, None);
        ctx.publish(&StatusEvent::done(msg, details, Some(final_md)));
        // Terminal stage: nothing further to enqueue.
        Ok(())
    }
}
