//! Status topic and the recorder that persists every stage transition.
//!
//! The topic is a broadcast fan-out carrying serialized [`StatusEvent`]s;
//! workers publish, the recorder subscribes and writes the job row, the
//! timeline append, and the document index upsert.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::message::{parse_stage_message, StatusEvent};
use crate::core::status::StatusStore;

#[derive(Clone)]
pub struct StatusTopic {
    tx: broadcast::Sender<String>,
}

impl Default for StatusTopic {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTopic {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event. Events are serialized at the boundary so every
    /// subscriber sees the wire format, not a shared in-process object.
    pub fn publish(&self, event: &StatusEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => {
                let _ = self.tx.send(payload);
            }
            Err(err) => warn!(job_id = %event.job_id, "failed to encode status event: {err}"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

pub struct StatusRecorder {
    store: Arc<StatusStore>,
    timeline_cap: usize,
}

impl StatusRecorder {
    pub fn new(store: Arc<StatusStore>, timeline_cap: usize) -> Self {
        Self {
            store,
            timeline_cap,
        }
    }

    /// Spawn the subscriber loop. Runs until the topic is dropped.
    pub fn spawn(self, topic: &StatusTopic) -> JoinHandle<()> {
        let mut rx = topic.subscribe();
        tokio::spawn(async move {
            loop {
                let payload = match rx.recv().await {
                    Ok(payload) => payload,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("status recorder lagged, skipped {skipped} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                self.handle(&payload).await;
            }
        })
    }

    /// Persist one raw event payload. Parse failures are terminal for the
    /// event (there is nothing to retry); store failures are retried a few
    /// times before the event is dropped with a warning.
    pub async fn handle(&self, payload: &str) {
        let mut event: StatusEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!("dead-lettering malformed status event: {err}");
                return;
            }
        };
        if event.details.parsed_message.is_none() {
            event.details.parsed_message = event
                .message
                .as_deref()
                .and_then(parse_stage_message);
        }
        for attempt in 0..3u32 {
            match self.store.record(&event, self.timeline_cap).await {
                Ok(()) => {
                    debug!(job_id = %event.job_id, stage = %event.stage, "status recorded");
                    return;
                }
                Err(err) if attempt < 2 => {
                    warn!(job_id = %event.job_id, "status store write failed, retrying: {err:#}");
                    tokio::time::sleep(std::time::Duration::from_millis(50 << attempt)).await;
                }
                Err(err) => {
                    warn!(job_id = %event.job_id, "dropping status event after retries: {err:#}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{EventDetails, Stage, StageMessage};

    #[tokio::test]
    async fn recorder_persists_published_events() {
        let store = Arc::new(StatusStore::in_memory().unwrap());
        store.admit("u1", "j1", "T", "A", 1, 1.0).await.unwrap();
        let topic = StatusTopic::new();
        let handle = StatusRecorder::new(store.clone(), 100).spawn(&topic);

        let msg = StageMessage::new("j1", "u1", Stage::Plan);
        topic.publish(&StatusEvent::done(
            &msg,
            EventDetails {
                duration_s: Some(1.0),
                tokens: Some(5),
                model: Some("m".into()),
                ..Default::default()
            },
            Some("jobs/u1/j1/plan.json".into()),
        ));

        // Wait for the subscriber to drain.
        for _ in 0..50 {
            if store.job("u1", "j1").await.unwrap().unwrap().stage == "PLAN_DONE" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let job = store.job("u1", "j1").await.unwrap().unwrap();
        assert_eq!(job.stage, "PLAN_DONE");
        let timeline = store.timeline("u1", "j1").await.unwrap();
        let parsed = timeline[0].details.parsed_message.as_ref().unwrap();
        assert_eq!(parsed["model"], "m");
        handle.abort();
    }

    #[tokio::test]
    async fn malformed_event_is_dropped() {
        let store = Arc::new(StatusStore::in_memory().unwrap());
        let recorder = StatusRecorder::new(store.clone(), 100);
        recorder.handle("not json at all").await;
        // No panic and nothing persisted.
        assert!(store.list_documents("u1").await.unwrap().is_empty());
    }
}
