//! Stage timing: a guard measuring wall-clock duration plus a best-effort
//! metrics blob under `metrics/` in the job root.

use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::core::storage::{JobPaths, ObjectStore};

pub struct StageTimer {
    started: Instant,
    stage: &'static str,
    cycle: Option<u32>,
}

#[derive(Serialize)]
struct StageMetrics<'a> {
    job_id: &'a str,
    stage: &'a str,
    cycle: Option<u32>,
    duration_s: f64,
}

impl StageTimer {
    pub fn start(stage: &'static str, cycle: Option<u32>) -> Self {
        Self {
            started: Instant::now(),
            stage,
            cycle,
        }
    }

    pub fn elapsed_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Upload the metrics blob. Failures are logged, never fatal: metrics
    /// must not fail a stage that otherwise succeeded.
    pub async fn finish(self, store: &dyn ObjectStore, paths: &JobPaths) -> f64 {
        let duration_s = self.elapsed_s();
        let name = match self.cycle {
            Some(cycle) => format!("{}_cycle{}", self.stage.to_lowercase(), cycle),
            None => format!("{}_once", self.stage.to_lowercase()),
        };
        let metrics = StageMetrics {
            job_id: &paths.job_id,
            stage: self.stage,
            cycle: self.cycle,
            duration_s,
        };
        if let Ok(body) = serde_json::to_string_pretty(&metrics) {
            if let Err(err) = store.put_text(&paths.metrics(&name), &body).await {
                debug!(stage = self.stage, "metrics upload failed: {err:#}");
            }
        }
        duration_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::FsObjectStore;

    #[tokio::test]
    async fn finish_writes_metrics_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let paths = JobPaths::new("u1", "j1");
        let timer = StageTimer::start("REVIEW", Some(2));
        let duration = timer.finish(&store, &paths).await;
        assert!(duration >= 0.0);
        let body = store
            .get_text("jobs/u1/j1/metrics/review_cycle2.json")
            .await
            .unwrap();
        assert!(body.contains("\"stage\": \"REVIEW\""));
    }
}
