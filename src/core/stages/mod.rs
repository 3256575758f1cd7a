//! Stage workers: one handler per queue, all sharing the same context and
//! the same skeleton (validate, start, load, execute, persist, enqueue,
//! done).

mod diagram_prep;
mod diagram_render;
mod finalize;
mod intake_resume;
mod plan;
mod plan_intake;
mod review;
mod rewrite;
mod verify;
mod write;

pub use diagram_prep::DiagramPrepStage;
pub use diagram_render::DiagramRenderStage;
pub use finalize::FinalizeStage;
pub use intake_resume::{IntakeContext, IntakeResumeStage};
pub use plan::PlanStage;
pub use plan_intake::PlanIntakeStage;
pub use review::ReviewStage;
pub use rewrite::RewriteStage;
pub use verify::VerifyStage;
pub use write::WriteStage;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Settings;
use crate::core::artifacts::DocumentConverter;
use crate::core::broker::QueueBroker;
use crate::core::diagram::DiagramRenderer;
use crate::core::error::StageError;
use crate::core::llm::{LlmError, LlmGateway};
use crate::core::message::{CycleState, Stage, StageMessage, StatusEvent};
use crate::core::plan::Plan;
use crate::core::recorder::StatusTopic;
use crate::core::status::StatusStore;
use crate::core::storage::{JobPaths, ObjectStore};

/// Everything a stage handler needs. One instance is shared by all workers
/// in a process; handlers hold no state of their own.
pub struct StageContext {
    pub settings: Arc<Settings>,
    pub broker: Arc<dyn QueueBroker>,
    pub store: Arc<dyn ObjectStore>,
    pub status: Arc<StatusStore>,
    pub topic: StatusTopic,
    pub gateway: Arc<dyn LlmGateway>,
    pub renderer: Option<Arc<dyn DiagramRenderer>>,
    pub converter: Option<Arc<dyn DocumentConverter>>,
}

impl StageContext {
    pub fn publish(&self, event: &StatusEvent) {
        self.topic.publish(event);
    }

    /// Publish the `QUEUED` transition and hand the message to the broker.
    pub async fn enqueue(
        &self,
        message: &StageMessage,
        delay: Option<Duration>,
    ) -> Result<(), StageError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| StageError::durable(format!("encoding stage message: {e}")))?;
        self.publish(&StatusEvent::queued(message));
        self.broker
            .enqueue(self.settings.queue_for(message.stage), payload, delay)
            .await
            .map_err(|e| StageError::transient(e))
    }

    /// Cycle counters: from the message when carried, otherwise from the job
    /// row, otherwise the single-cycle default.
    pub async fn cycles(&self, msg: &StageMessage) -> CycleState {
        if let Some(state) = msg.cycle_state() {
            return state;
        }
        match self.status.job(&msg.owner_id, &msg.job_id).await {
            Ok(Some(job)) => CycleState::new(job.cycles_requested, job.cycles_completed),
            _ => CycleState::new(1, 0),
        }
    }

    pub async fn load_plan(&self, paths: &JobPaths) -> Result<Plan, StageError> {
        let plan: Plan = self
            .store
            .get_json(&paths.plan())
            .await
            .map_err(|e| StageError::durable(format!("loading plan: {e:#}")))?;
        plan.validate()
            .map_err(|e| StageError::logic(format!("persisted plan is invalid: {e}")))?;
        Ok(plan)
    }

    /// Assemble the full document from per-section drafts in plan order.
    pub async fn load_document(
        &self,
        paths: &JobPaths,
        plan: &Plan,
    ) -> Result<String, StageError> {
        let mut parts = Vec::with_capacity(plan.sections.len());
        for section in &plan.sections {
            let draft = self
                .store
                .get_text(&paths.draft(&section.id))
                .await
                .map_err(|e| StageError::durable(format!("loading draft {}: {e:#}", section.id)))?;
            parts.push(draft.trim_end().to_string());
        }
        Ok(parts.join("\n\n"))
    }

    /// Persist a merged full document back into the per-section drafts.
    pub async fn store_document_sections(
        &self,
        paths: &JobPaths,
        document: &str,
    ) -> Result<(), StageError> {
        for (id, block) in crate::core::markdown::extract_sections(document) {
            self.store
                .put_text(&paths.draft(&id), &format!("{block}\n"))
                .await
                .map_err(|e| StageError::durable(format!("storing draft {id}: {e:#}")))?;
        }
        Ok(())
    }

    /// Mirror the authoritative memory snapshot to `memory.json`.
    pub async fn mirror_memory(&self, paths: &JobPaths) -> Result<(), StageError> {
        let (_, memory) = self
            .status
            .memory(&paths.job_id)
            .await
            .map_err(StageError::from)?;
        self.store
            .put_json(&paths.memory(), &memory)
            .await
            .map_err(StageError::from)
    }
}

/// Map a gateway error onto the retry taxonomy.
pub fn map_llm_error(err: LlmError) -> StageError {
    if err.is_transient() {
        StageError::transient(err)
    } else {
        StageError::durable(err)
    }
}

/// Read a stored JSON artifact, treating absence as `None`.
pub async fn read_optional_json<T: serde::de::DeserializeOwned>(
    ctx: &StageContext,
    blob: &str,
) -> Result<Option<T>, StageError> {
    match ctx.store.exists(blob).await {
        Ok(true) => Ok(Some(ctx.store.get_json(blob).await.map_err(StageError::from)?)),
        Ok(false) => Ok(None),
        Err(e) => Err(StageError::durable(e)),
    }
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;
    async fn handle(&self, ctx: &StageContext, msg: &StageMessage) -> Result<(), StageError>;
}

/// All ten stage handlers, one per queue.
pub fn handlers() -> Vec<Arc<dyn StageHandler>> {
    vec![
        Arc::new(PlanIntakeStage),
        Arc::new(IntakeResumeStage),
        Arc::new(PlanStage),
        Arc::new(WriteStage),
        Arc::new(ReviewStage),
        Arc::new(VerifyStage),
        Arc::new(RewriteStage),
        Arc::new(DiagramPrepStage),
        Arc::new(DiagramRenderStage),
        Arc::new(FinalizeStage),
    ]
}

/// Answers map type shared by intake and the kernel API.
pub type AnswerMap = BTreeMap<String, String>;
