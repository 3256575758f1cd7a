//! write: draft the sections addressed by this message, feed the shared
//! memory, and advance to review once every section has a draft.
//!
//! A section is only written when all of its predecessors have persisted
//! drafts; otherwise the delivery is abandoned with a short visibility
//! delay and redelivered later (the dependency-ready check).

use async_trait::async_trait;
use tracing::debug;

use super::{map_llm_error, StageContext, StageHandler};
use crate::core::agents::{Summarizer, WriterAgent};
use crate::core::error::StageError;
use crate::core::memory::MemoryDelta;
use crate::core::message::{EventDetails, Stage, StageMessage, StatusEvent};
use crate::core::storage::{JobPaths, ObjectStore};
use crate::core::telemetry::StageTimer;

pub struct WriteStage;

#[async_trait]
impl StageHandler for WriteStage {
    fn stage(&self) -> Stage {
        Stage::Write
    }

    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError> {
        if msg.sections.is_empty() {
            return Err(StageError::validation("write message addresses no sections"));
        }
        let paths = JobPaths::new(&msg.owner_id, &msg.job_id);
        let plan = ctx.load_plan(&paths).await?;
        for id in &msg.sections {
            if plan.section(id).is_none() {
                return Err(StageError::validation(format!(
                    "write message names unknown section {id}"
                )));
            }
        }

        // Dependency-ready check against the object store, not the message.
        // Sections earlier in this batch count as satisfied: batches are in
        // topological order and written front to back.
        let mut in_batch: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for id in &msg.sections {
            let section = plan.section(id).expect("validated above");
            for dep in &section.depends_on {
                if in_batch.contains(dep.as_str()) {
                    continue;
                }
                let ready = ctx
                    .store
                    .exists(&paths.draft(dep))
                    .await
                    .map_err(StageError::from)?;
                if !ready {
                    return Err(StageError::NotReady(format!(
                        "section {id} waits for draft of {dep}"
                    )));
                }
            }
            in_batch.insert(id.as_str());
        }

        let timer = StageTimer::start("WRITE", None);
        let writer = WriterAgent::new(ctx.gateway.clone());
        let summarizer = Summarizer::new(ctx.gateway.clone());
        let mut tokens_total = 0u64;
        let mut last_artifact = None;

        for id in &msg.sections {
            let section = plan.section(id).expect("validated above");
            let draft_blob = paths.draft(id);

            // Replayed deliveries skip sections that already have drafts, so
            // a retry never changes persisted content.
            let already_written = ctx
                .store
                .exists(&draft_blob)
                .await
                .map_err(StageError::from)?;
            if !already_written {
                let (_, memory) = ctx
                    .status
                    .memory(&msg.job_id)
                    .await
                    .map_err(StageError::from)?;
                let dep_context = memory.dependency_context(section);
                let (markdown, write_tokens) = writer
                    .write_section(&plan, section, &dep_context, None)
                    .await
                    .map_err(map_llm_error)?;
                ctx.store
                    .put_text(&draft_blob, &markdown)
                    .await
                    .map_err(StageError::from)?;
                tokens_total += write_tokens;

                let (summary, summary_tokens) = summarizer
                    .summarize_section(&markdown)
                    .await
                    .map_err(map_llm_error)?;
                tokens_total += summary_tokens;
                record_memory(ctx, msg, id, summary).await?;
                ctx.mirror_memory(&paths).await?;
            } else {
                debug!(job_id = %msg.job_id, section = %id, "draft exists, skipping");
            }

            ctx.status
                .record_completion(&msg.job_id, "draft", id)
                .await
                .map_err(StageError::from)?;
            last_artifact = Some(draft_blob);
        }

        let drafted = ctx
            .status
            .completion_count(&msg.job_id, "draft")
            .await
            .map_err(StageError::from)?;
        let duration_s = timer.finish(ctx.store.as_ref(), &paths).await;

        if drafted as usize == plan.sections.len() {
            let cycles = ctx.cycles(msg).await;
            ctx.enqueue(
                &msg.forward(Stage::Review)
                    .with_cycle(cycles.current_index())
                    .with_cycles(cycles),
                None,
            )
            .await?;
            let details = EventDetails {
                duration_s: Some(duration_s),
                tokens: Some(tokens_total),
                model: Some(ctx.settings.writer_model.clone()),
                ..Default::default()
            }
            .with_cycles(cycles, None);
            ctx.publish(&StatusEvent::done(msg, details, last_artifact));
        }
        Ok(())
    }
}

/// Merge a section summary into the shared memory under the version CAS,
/// retrying the merge when a sibling writer won the race.
async fn record_memory(
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
