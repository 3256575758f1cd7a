//! Worker runtime: the receive → handle → settle loop shared by every stage.
//!
//! The loop owns the §-level policy: malformed or owner-less messages are
//! dead-lettered, cancellation dead-letters with reason `cancelled`,
//! dependency backpressure abandons with a delay and no failure event,
//! transient/durable failures abandon for broker redelivery with a
//! delivery-count backoff, and validation/logic failures dead-letter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::error::StageError;
use crate::core::message::{Stage, StageMessage, StatusEvent};
use crate::core::stages::{handlers, StageContext, StageHandler};

/// Redelivery backoff derived from how often the message was delivered.
fn redelivery_delay(delivery_count: u32, base_ms: u64) -> Duration {
    let exponent = delivery_count.saturating_sub(1).min(6);
    Duration::from_millis((base_ms.max(1) << exponent).min(60_000))
}

pub struct WorkerPool {
    ctx: Arc<StageContext>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    /// Spawn one worker task per stage queue. Workers drain until `shutdown`
    /// flips to true and their current delivery is settled.
    pub fn spawn_all(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        handlers()
            .into_iter()
            .map(|handler| self.spawn_one(handler, shutdown.clone()))
            .collect()
    }

    pub fn spawn_one(
        &self,
        handler: Arc<dyn StageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let stage = handler.stage();
            info!(stage = stage.as_str(), "stage worker started");
            run_worker_loop(ctx, handler, shutdown).await;
            info!(stage = stage.as_str(), "stage worker stopped");
        })
    }
}

async fn run_worker_loop(
    ctx: Arc<StageContext>,
    handler: Arc<dyn StageHandler>,
    shutdown: watch::Receiver<bool>,
) {
    let stage = handler.stage();
    let queue = ctx.settings.queue_for(stage).to_string();
    let lock_duration = Duration::from_secs(ctx.settings.lock_duration_s);
    while !*shutdown.borrow() {
        let lease = match ctx
            .broker
            .receive(&queue, lock_duration, Duration::from_millis(500))
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => continue,
            Err(err) => {
                warn!(stage = stage.as_str(), "broker receive failed: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };
        process_delivery(&ctx, handler.as_ref(), stage, &lease).await;
    }
}

async fn process_delivery(
    ctx: &StageContext,
    handler: &dyn StageHandler,
    stage: Stage,
    lease: &crate::core::broker::Lease,
) {
    // 1. Parse; structural failure is terminal for the delivery.
    let mut msg: StageMessage = match serde_json::from_str(&lease.payload) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(stage = stage.as_str(), "dead-lettering malformed message: {err}");
            let _ = ctx
                .broker
                .dead_letter(&lease.lock_token, &format!("validation: {err}"))
                .await;
            return;
        }
    };
    msg.attempt = lease.delivery_count;
    if let Err(err) = msg.validate(stage) {
        warn!(stage = stage.as_str(), job_id = %msg.job_id, "invalid message: {err}");
        if !msg.owner_id.trim().is_empty() {
            ctx.publish(&StatusEvent::failed(&msg, err.kind(), &err.to_string()));
        }
        let _ = ctx.broker.dead_letter(&lease.lock_token, err.kind()).await;
        return;
    }

    // 2. Cancellation gate.
    if ctx.status.is_cancelled(&msg.job_id).await.unwrap_or(false) {
        info!(job_id = %msg.job_id, stage = stage.as_str(), "job cancelled, dead-lettering");
        let _ = ctx.broker.dead_letter(&lease.lock_token, "cancelled").await;
        return;
    }

    // 3. Remember the input so resume_failed can replay it.
    if let Err(err) = ctx
        .status
        .save_stage_input(&msg.job_id, stage.as_str(), &lease.payload)
        .await
    {
        warn!(job_id = %msg.job_id, "failed to save stage input: {err:#}");
    }

    ctx.publish(&StatusEvent::started(&msg));

    // 4. Keep the lock alive while the handler runs.
    let renewer = spawn_lock_renewer(ctx, lease);
    let result = handler.handle(ctx, &msg).await;
    renewer.abort();

    // 5. Settle.
    match result {
        Ok(()) => {
            if let Err(err) = ctx.broker.complete(&lease.lock_token).await {
                warn!(job_id = %msg.job_id, "completing delivery failed: {err}");
            }
        }
        Err(StageError::NotReady(reason)) => {
            debug!(job_id = %msg.job_id, stage = stage.as_str(), "abandoning: {reason}");
            let delay = Duration::from_secs(ctx.settings.write_retry_delay_s);
            let _ = ctx.broker.abandon(&lease.lock_token, Some(delay)).await;
        }
        Err(StageError::Cancelled) => {
            let _ = ctx.broker.dead_letter(&lease.lock_token, "cancelled").await;
        }
        Err(err) if err.is_terminal() => {
            error!(job_id = %msg.job_id, stage = stage.as_str(), "terminal failure: {err}");
            ctx.publish(&StatusEvent::failed(&msg, err.kind(), &err.to_string()));
            let _ = ctx.broker.dead_letter(&lease.lock_token, err.kind()).await;
        }
        Err(err) => {
            warn!(
                job_id = %msg.job_id,
                stage = stage.as_str(),
                delivery_count = lease.delivery_count,
                "failure, abandoning for redelivery: {err}"
            );
            ctx.publish(&StatusEvent::failed(&msg, err.kind(), &err.to_string()));
            let delay = redelivery_delay(lease.delivery_count, ctx.settings.redelivery_base_ms);
            let _ = ctx.broker.abandon(&lease.lock_token, Some(delay)).await;
        }
    }
}

fn spawn_lock_renewer(ctx: &StageContext, lease: &crate::core::broker::Lease) -> JoinHandle<()> {
    let broker = ctx.broker.clone();
    let token = lease.lock_token.clone();
    let lock_duration = Duration::from_secs(ctx.settings.lock_duration_s);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(lock_duration / 2);
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            if broker.renew_lock(&token, lock_duration).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivery_backoff_grows_and_caps() {
        assert_eq!(redelivery_delay(1, 1000), Duration::from_secs(1));
        assert_eq!(redelivery_delay(2, 1000), Duration::from_secs(2));
        assert_eq!(redelivery_delay(4, 1000), Duration::from_secs(8));
        assert_eq!(redelivery_delay(10, 1000), Duration::from_secs(60));
        assert_eq!(redelivery_delay(3, 0), Duration::from_millis(4));
    }
}
