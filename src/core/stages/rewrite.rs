//! rewrite: regenerate the flagged sections with the review findings as
//! guidance, then hand the next cycle back to review.

use async_trait::async_trait;

use super::{map_llm_error, read_optional_json, StageContext, StageHandler};
use crate::core::agents::{ReviewNote, ReviewerFlavor, Summarizer, VerifyReport, WriterAgent};
use crate::core::error::StageError;
use crate::core::memory::MemoryDelta;
use crate::core::message::{EventDetails, Stage, StageMessage, StatusEvent};
use crate::core::storage::{JobPaths, ObjectStore};
use crate::core::telemetry::StageTimer;

pub struct RewriteStage;

#[async_trait]
impl StageHandler for RewriteStage {
    fn stage(&self) -> Stage {
        Stage::Rewrite
    }

    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError> {
        if msg.sections.is_empty() {
            return Err(StageError::validation(
                "rewrite message addresses no sections",
            ));
        }
        let paths = JobPaths::new(&msg.owner_id, &msg.job_id);
        let cycles = ctx.cycles(msg).await;
        if cycles.exhausted() {
            return Err(StageError::logic(format!(
                "rewrite requested past the cycle budget ({})",
                cycles.requested
            )));
        }
        let cycle_idx = msg.cycle.unwrap_or_else(|| cycles.current_index());
        let timer = StageTimer::start("REWRITE", Some(cycle_idx));

        let plan = ctx.load_plan(&paths).await?;
        let report: VerifyReport =
            read_optional_json(ctx, &paths.review(cycle_idx, "verify.json"))
                .await?
                .unwrap_or_default();
        let mut notes = Vec::new();
        for flavor in [
            ReviewerFlavor::General,
            ReviewerFlavor::Style,
            ReviewerFlavor::Cohesion,
        ] {
            if let Some(note) = read_optional_json::<ReviewNote>(
                ctx,
                &paths.review(cycle_idx, &flavor.artifact_name()),
            )
            .await?
            {
                notes.push(note);
            }
        }

        let writer = WriterAgent::new(ctx.gateway.clone());
        let summarizer = Summarizer::new(ctx.gateway.clone());
        let mut tokens_total = 0u64;

        for id in &msg.sections {
            let Some(section) = plan.section(id) else {
                continue;
            };
            let rewrite_blob = paths.rewrite(cycle_idx, id);
            // Replay guard: this cycle's rewrite of the section already
            // landed, the canonical draft was already swapped.
            if ctx
                .store
                .exists(&rewrite_blob)
                .await
                .map_err(StageError::from)?
            {
                continue;
            }

            let guidance = guidance_for(id, &notes, &report);
            let (_, memory) = ctx
                .status
                .memory(&msg.job_id)
                .await
                .map_err(StageError::from)?;
            let dep_context = memory.dependency_context(section);
            let (markdown, tokens) = writer
                .write_section(&plan, section, &dep_context, guidance.as_deref())
                .await
                .map_err(map_llm_error)?;
            tokens_total += tokens;

            // Write the cycle copy first, then swap the canonical draft.
            ctx.store
                .put_text(&rewrite_blob, &markdown)
                .await
                .map_err(StageError::from)?;
            ctx.store
                .put_text(&paths.draft(id), &markdown)
                .await
                .map_err(StageError::from)?;

            let (summary, summary_tokens) = summarizer
                .summarize_section(&markdown)
                .await
                .map_err(map_llm_error)?;
            tokens_total += summary_tokens;
            update_memory(ctx, msg, id, summary).await?;
            ctx.mirror_memory(&paths).await?;
        }

        let next_cycles = cycles.consume_rewrite();
        ctx.enqueue(
            &msg.forward(Stage::Review)
                .with_cycle(next_cycles.current_index())
                .with_cycles(next_cycles),
            None,
        )
        .await?;

        let duration_s = timer.finish(ctx.store.as_ref(), &paths).await;
        let details = EventDetails {
            duration_s: Some(duration_s),
            tokens: Some(tokens_total),
            model: Some(ctx.settings.writer_model.clone()),
            ..Default::default()
        }
        .with_cycles(next_cycles, Some(cycle_idx));
        ctx.publish(&StatusEvent::done(
            msg,
            details,
            Some(paths.rewrite(cycle_idx, &msg.sections[0])),
        ));
        Ok(())
    }
}

/// Findings that apply to one section, rendered as revision guidance.
fn guidance_for(section_id: &str, notes: &[ReviewNote], report: &VerifyReport) -> Option<String> {
    let mut lines = Vec::new();
    for contradiction in &report.contradictions {
        let applies = contradiction
            .section_id
            .as_deref()
            .map(|sid| sid == section_id)
            .unwrap_or(true);
        if applies {
            if let Some(explanation) = &contradiction.explanation {
                lines.push(format!("contradiction: {explanation}"));
            }
            if let Some(fix) = &contradiction.fix {
                lines.push(format!("fix: {fix}"));
            }
        }
    }
    for note in notes {
        for issue in &note.issues {
            let applies = issue
                .section_id
                .as_deref()
                .map(|sid| sid == section_id)
                .unwrap_or(true);
            if applies {
                lines.push(issue.description.clone());
                if let Some(patch) = &issue.suggested_patch {
                    lines.push(format!("suggested patch: {patch}"));
                }
            }
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

async fn update_memory(
    ctx: &StageContext,
    msg: &StageMessage,
    section_id: &str,
    summary: String,
) -> Result<(), StageError> {
    let delta = MemoryDelta {
        section_id: section_id.to_string(),
        summary,
        ..Default::default()
    };
    for _ in 0..8 {
        let (version, mut memory) = ctx
            .status
            .memory(&msg.job_id)
            .await
            .map_err(StageError::from)?;
        memory.apply(&delta);
        if ctx
            .status
            .swap_memory(&msg.owner_id, &msg.job_id, version, &memory)
            .await
            .map_err(StageError::from)?
        {
            return Ok(());
        }
    }
    Err(StageError::durable(format!(
        "memory merge for section {section_id} kept losing the version race"
    )))
}
