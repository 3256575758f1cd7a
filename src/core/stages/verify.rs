//! verify: fold the reviewer's revision into the draft, run the
//! contradiction check, and decide between another rewrite cycle and the
//! diagram pipeline. This stage owns the cycle-bound termination guarantee.

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::{map_llm_error, read_optional_json, StageContext, StageHandler};
use crate::core::agents::{requires_rewrite, ReviewNote, ReviewerFlavor, VerifierAgent, VerifyReport};
use crate::core::error::StageError;
use crate::core::markdown::{find_placeholder_sections, merge_revised};
use crate::core::message::{CycleState, EventDetails, Stage, StageMessage, StatusEvent};
use crate::core::storage::{JobPaths, ObjectStore};
use crate::core::telemetry::StageTimer;

pub struct VerifyStage;

#[async_trait]
impl StageHandler for VerifyStage {
    fn stage(&self) -> Stage {
        Stage::Verify
    }

    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError> {
        let paths = JobPaths::new(&msg.owner_id, &msg.job_id);
        let cycles = ctx.cycles(msg).await;
        let cycle_idx = msg.cycle.unwrap_or_else(|| cycles.current_index());
        let timer = StageTimer::start("VERIFY", Some(cycle_idx));

        let plan = ctx.load_plan(&paths).await?;
        let mut document = ctx.load_document(&paths, &plan).await?;

        // Fold the general reviewer's full-document revision into the draft.
        let general: ReviewNote = read_optional_json(
            ctx,
            &paths.review(cycle_idx, &ReviewerFlavor::General.artifact_name()),
        )
        .await?
        .unwrap_or_default();
        if let Some(revised) = general
            .revised_markdown
            .as_deref()
            .filter(|r| !r.trim().is_empty())
        {
            let merged = merge_revised(&document, revised);
            if merged != document {
                ctx.store_document_sections(&paths, &merged).await?;
                ctx.store
                    .put_text(&paths.review(cycle_idx, "revision.md"), &merged)
                    .await
                    .map_err(StageError::from)?;
                document = merged;
            }
        }

        let mut notes = vec![general];
        for flavor in [
            ReviewerFlavor::Style,
            ReviewerFlavor::Cohesion,
            ReviewerFlavor::Summary,
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

        let placeholders = find_placeholder_sections(&document);
        let (_, memory) = ctx
            .status
            .memory(&msg.job_id)
            .await
            .map_err(StageError::from)?;

        let verifier = VerifierAgent::new(ctx.gateway.clone());
        let (report, tokens) = verifier
            .verify(&memory.summaries_json(), &document)
            .await
            .map_err(map_llm_error)?;

        let needs_rewrite =
            report.needs_rewrite || requires_rewrite(&notes) || !placeholders.is_empty();
        let consolidated = VerifyReport {
            contradictions: report.contradictions.clone(),
            needs_rewrite,
        };
        let verify_blob = paths.review(cycle_idx, "verify.json");
        ctx.store
            .put_json(&verify_blob, &consolidated)
            .await
            .map_err(StageError::from)?;

        let mut event_notes = Vec::new();
        if !report.contradictions.is_empty() {
            event_notes.push("contradictions detected");
        }
        if notes.iter().any(requires_note_rewrite) {
            event_notes.push("review findings pending");
        }
        if !placeholders.is_empty() {
            event_notes.push("placeholders present");
        }

        // Termination guarantee: once the budget is reached, advance
        // regardless of the rewrite decision.
        let advance = !needs_rewrite || cycle_idx >= cycles.requested;
        let recorded_cycles = if advance {
            CycleState::new(cycles.requested, cycle_idx)
        } else {
            cycles
        };

        if advance {
            ctx.enqueue(
                &msg.forward(Stage::DiagramPrep).with_cycles(recorded_cycles),
                None,
            )
            .await?;
        } else {
            let mut affected: BTreeSet<String> = report.sections();
            for note in &notes {
                affected.extend(note.sections());
            }
            affected.extend(placeholders.iter().cloned());
            if affected.is_empty() {
                affected.extend(plan.section_ids());
            }
            ctx.enqueue(
                &msg.forward(Stage::Rewrite)
                    .with_cycle(cycle_idx)
                    .with_cycles(cycles)
                    .with_sections(affected.into_iter().collect()),
                None,
            )
            .await?;
        }

        let duration_s = timer.finish(ctx.store.as_ref(), &paths).await;
        let details = EventDetails {
            duration_s: Some(duration_s),
            tokens: Some(tokens),
            model: Some(ctx.settings.reviewer_model.clone()),
            notes: if event_notes.is_empty() {
                None
            } else {
                Some(event_notes.join("; "))
            },
            ..Default::default()
        }
        .with_cycles(recorded_cycles, Some(cycle_idx));
        ctx.publish(&StatusEvent::done(msg, details, Some(verify_blob)));
        Ok(())
    }
}

fn requires_note_rewrite(note: &ReviewNote) -> bool {
    requires_rewrite(std::slice::from_ref(note))
}
