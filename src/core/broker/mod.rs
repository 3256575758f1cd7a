//! Queue broker abstraction: at-least-once delivery, per-message locks,
//! dead-lettering on repeated failure.
//!
//! Workers must be idempotent; the broker may redeliver any message whose
//! lock expired or that was abandoned. The in-memory implementation backs
//! local runs and the test suite; production transports plug in behind the
//! same trait.

mod memory;

pub use memory::InMemoryBroker;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("unknown or expired lock token {0}")]
    UnknownLock(String),
    #[error("unknown queue {0}")]
    UnknownQueue(String),
}

/// A delivered message with its lock.
#[derive(Debug, Clone)]
pub struct Lease {
    pub queue: String,
    /// Raw JSON payload. Parsing is the worker's job so that malformed
    /// messages can be dead-lettered rather than poison the receive loop.
    pub payload: String,
    pub lock_token: String,
    /// How many times this message has been delivered, this lease included.
    pub delivery_count: u32,
}

/// A message parked in the dead-letter queue for operator inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub payload: String,
    pub reason: String,
    pub delivery_count: u32,
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Durably accept a message for later delivery. `delay` postpones
    /// visibility.
    async fn enqueue(
        &self,
        queue: &str,
        payload: String,
        delay: Option<Duration>,
    ) -> Result<(), BrokerError>;

    /// Wait up to `wait` for a message; `None` when the queue stayed empty.
    /// The returned lease is held for `lock_duration` before the message
    /// becomes deliverable again.
    async fn receive(
        &self,
        queue: &str,
        lock_duration: Duration,
        wait: Duration,
    ) -> Result<Option<Lease>, BrokerError>;

    /// Settle a delivery successfully; the message is gone.
    async fn complete(&self, lock_token: &str) -> Result<(), BrokerError>;

    /// Release the lock for redelivery, optionally after a backoff delay.
    async fn abandon(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), BrokerError>;

    /// Park the message in the dead-letter queue. Terminal.
    async fn dead_letter(&self, lock_token: &str, reason: &str) -> Result<(), BrokerError>;

    /// Extend a held lock.
    async fn renew_lock(&self, lock_token: &str, extension: Duration) -> Result<(), BrokerError>;

    /// Dead-lettered messages for a queue, oldest first.
    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError>;

    /// Approximate count of deliverable + in-flight messages; used by the
    /// test harness to detect quiescence.
    async fn pending(&self, queue: &str) -> Result<usize, BrokerError>;
}
