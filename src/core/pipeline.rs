//! The kernel API exposed to the HTTP layer: admission, intake answers,
//! status, timeline, artifact access, cancellation, and failure resumption.
//! Every operation enforces the caller's ownership before touching state.

use std::sync::Arc;

use serde::Serialize;

use crate::core::artifacts::{build_diagram_archive, content_type_for};
use crate::core::error::KernelError;
use crate::core::message::{unix_now, CycleState, Stage, StageMessage, StatusEvent};
use crate::core::stages::{AnswerMap, StageContext};
use crate::core::status::{JobRecord, TimelineEvent};
use crate::core::storage::{JobPaths, ObjectStore};

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub stage: String,
    pub cycle: Option<u32>,
    pub message: String,
    pub artifact: Option<String>,
    pub has_error: bool,
    pub last_error: Option<String>,
    pub cycles_requested: u32,
    pub cycles_completed: u32,
}

pub struct Kernel {
    ctx: Arc<StageContext>,
}

impl Kernel {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> Arc<StageContext> {
        self.ctx.clone()
    }

    /// Admit a new job: index row, admission event, and the plan-intake
    /// message. Returns the fresh job id (admission is never idempotent).
    pub async fn admit_job(
        &self,
        owner_id: &str,
        title: &str,
        audience: &str,
        cycles: u32,
    ) -> Result<String, KernelError> {
        if owner_id.trim().is_empty() {
            return Err(KernelError::InvalidRequest("owner_id is required".into()));
        }
        if title.trim().is_empty() {
            return Err(KernelError::InvalidRequest("title is required".into()));
        }
        if !(1..=5).contains(&cycles) {
            return Err(KernelError::InvalidRequest(
                "cycles must be between 1 and 5".into(),
            ));
        }
        let job_id = uuid::Uuid::new_v4().to_string();
        self.ctx
            .status
            .admit(owner_id, &job_id, title, audience, cycles, unix_now())
            .await?;
        self.ctx.publish(&StatusEvent::enqueued(&job_id, owner_id));

        let message = StageMessage::new(&job_id, owner_id, Stage::PlanIntake)
            .with_cycles(CycleState::new(cycles, 0))
            .with_extra("title", serde_json::json!(title))
            .with_extra("audience", serde_json::json!(audience));
        self.ctx
            .enqueue(&message, None)
            .await
            .map_err(|e| KernelError::Internal(anyhow::anyhow!(e.to_string())))?;
        Ok(job_id)
    }

    /// Persist intake answers and wake the pipeline. Idempotent: identical
    /// answers produce identical blobs and a redundant resume message that
    /// the pipeline absorbs.
    pub async fn submit_answers(
        &self,
        owner_id: &str,
        job_id: &str,
        answers: &AnswerMap,
    ) -> Result<(), KernelError> {
        let job = self.authorize(owner_id, job_id).await?;
        let paths = JobPaths::new(&job.owner_id, &job.job_id);
        self.ctx
            .store
            .put_json(&paths.intake("answers.json"), answers)
            .await?;
        let message = StageMessage::new(job_id, owner_id, Stage::IntakeResume)
            .with_cycles(CycleState::new(job.cycles_requested, job.cycles_completed));
        self.ctx
            .enqueue(&message, None)
            .await
            .map_err(|e| KernelError::Internal(anyhow::anyhow!(e.to_string())))?;
        Ok(())
    }

    pub async fn get_status(&self, owner_id: &str, job_id: &str) -> Result<JobStatus, KernelError> {
        let job = self.authorize(owner_id, job_id).await?;
        Ok(JobStatus {
            stage: job.stage,
            cycle: if job.cycles_completed > 0 || job.cycles_requested > 1 {
                Some((job.cycles_completed + 1).min(job.cycles_requested))
            } else {
                None
            },
            message: job.message,
            artifact: job.artifact,
            has_error: job.has_error,
            last_error: job.last_error,
            cycles_requested: job.cycles_requested,
            cycles_completed: job.cycles_completed,
        })
    }

    pub async fn get_timeline(
        &self,
        owner_id: &str,
        job_id: &str,
    ) -> Result<Vec<TimelineEvent>, KernelError> {
        self.authorize(owner_id, job_id).await?;
        Ok(self.ctx.status.timeline(owner_id, job_id).await?)
    }

    pub async fn list_documents(&self, owner_id: &str) -> Result<Vec<JobRecord>, KernelError> {
        Ok(self.ctx.status.list_documents(owner_id).await?)
    }

    /// Fetch an artifact by job-relative path. The ownership check happens
    /// before any blob I/O; cross-owner requests never reach the store.
    pub async fn fetch_artifact(
        &self,
        owner_id: &str,
        job_id: &str,
        relative_path: &str,
    ) -> Result<(Vec<u8>, &'static str), KernelError> {
        self.authorize(owner_id, job_id).await?;
        let paths = JobPaths::new(owner_id, job_id);
        let blob = paths.resolve(relative_path);
        if !paths.contains(&blob) || relative_path.contains("..") {
            return Err(KernelError::InvalidRequest(format!(
                "artifact path {relative_path} escapes the job root"
            )));
        }
        let bytes = self.ctx.store.get_bytes(&blob).await.map_err(|_| {
            KernelError::InvalidRequest(format!("artifact {relative_path} not found"))
        })?;
        Ok((bytes, content_type_for(&blob)))
    }

    /// The diagram bundle; served from the stored archive when finalize has
    /// produced it, built on the fly otherwise.
    pub async fn fetch_diagram_archive(
        &self,
        owner_id: &str,
        job_id: &str,
    ) -> Result<Vec<u8>, KernelError> {
        self.authorize(owner_id, job_id).await?;
        let paths = JobPaths::new(owner_id, job_id);
        if self.ctx.store.exists(&paths.diagram_archive()).await? {
            return Ok(self.ctx.store.get_bytes(&paths.diagram_archive()).await?);
        }
        Ok(build_diagram_archive(self.ctx.store.as_ref(), &paths).await?)
    }

    /// Best-effort cancellation: workers observe the flag on entry.
    pub async fn cancel(&self, owner_id: &str, job_id: &str) -> Result<(), KernelError> {
        self.authorize(owner_id, job_id).await?;
        self.ctx.status.set_cancelled(owner_id, job_id).await?;
        Ok(())
    }

    /// Re-enqueue the most recent failed stage's input. Idempotent worker
    /// outputs guarantee no corruption on re-run.
    pub async fn resume_failed(&self, owner_id: &str, job_id: &str) -> Result<(), KernelError> {
        self.authorize(owner_id, job_id).await?;
        let failed_event = self
            .ctx
            .status
            .latest_failed_stage(owner_id, job_id)
            .await?
            .ok_or_else(|| {
                KernelError::InvalidRequest("job has no failed stage to resume".into())
            })?;
        let label = failed_event.trim_end_matches("_FAILED");
        let stage = Stage::from_event_label(label).ok_or_else(|| {
            KernelError::InvalidRequest(format!("unknown failed stage {failed_event}"))
        })?;
        let payload = self
            .ctx
            .status
            .stage_input(job_id, stage.as_str())
            .await?
            .ok_or_else(|| {
                KernelError::InvalidRequest(format!(
                    "no recorded input for stage {}",
                    stage.as_str()
                ))
            })?;
        self.ctx
            .broker
            .enqueue(self.ctx.settings.queue_for(stage), payload, None)
            .await
            .map_err(|e| KernelError::Internal(anyhow::anyhow!(e.to_string())))?;
        Ok(())
    }

    /// Owner gate shared by every operation: a job owned by someone else is
    /// a structured not-authorized error, an unknown job is not-found.
    async fn authorize(&self, owner_id: &str, job_id: &str) -> Result<JobRecord, KernelError> {
        match self.ctx.status.job(owner_id, job_id).await? {
            Some(job) => Ok(job),
            None => match self.ctx.status.owner_of(job_id).await? {
                Some(_) => Err(KernelError::NotAuthorized),
                None => Err(KernelError::JobNotFound(job_id.to_string())),
            },
        }
    }
}
