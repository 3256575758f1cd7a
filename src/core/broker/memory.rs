//! In-process broker with Service Bus-like semantics: named queues,
//! visibility delays, per-delivery locks, delivery counting, and a
//! dead-letter queue per queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{BrokerError, DeadLetter, Lease, QueueBroker};

#[derive(Debug, Clone)]
struct Pending {
    payload: String,
    delivery_count: u32,
    visible_at: Instant,
}

#[derive(Debug)]
struct InFlight {
    queue: String,
    payload: String,
    delivery_count: u32,
    lock_expires: Instant,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Pending>,
    dead: Vec<DeadLetter>,
}

struct BrokerState {
    queues: HashMap<String, QueueState>,
    in_flight: HashMap<String, InFlight>,
}

pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    max_delivery_count: u32,
}

impl InMemoryBroker {
    pub fn new(max_delivery_count: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState {
                queues: HashMap::new(),
                in_flight: HashMap::new(),
            }),
            notify: Notify::new(),
            max_delivery_count: max_delivery_count.max(1),
        })
    }

    /// Return expired locks to their queues. Called opportunistically from
    /// every receive pass.
    fn reap_expired(state: &mut BrokerState, now: Instant) {
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.lock_expires <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(flight) = state.in_flight.remove(&token) {
                state
                    .queues
                    .entry(flight.queue)
                    .or_default()
                    .pending
                    .push(Pending {
                        payload: flight.payload,
                        delivery_count: flight.delivery_count,
                        visible_at: now,
                    });
            }
        }
    }

    fn try_pop(
        &self,
        state: &mut BrokerState,
        queue: &str,
        lock_duration: Duration,
        now: Instant,
    ) -> Option<Lease> {
        loop {
            let message = {
                let queue_state = state.queues.entry(queue.to_string()).or_default();
                let idx = queue_state
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.visible_at <= now)
                    .min_by_key(|(_, p)| p.visible_at)
                    .map(|(i, _)| i)?;
                let mut message = queue_state.pending.remove(idx);
                message.delivery_count += 1;
                if message.delivery_count > self.max_delivery_count {
                    queue_state.dead.push(DeadLetter {
                        queue: queue.to_string(),
                        payload: message.payload,
                        reason: "max delivery count exceeded".to_string(),
                        delivery_count: message.delivery_count - 1,
                    });
                    continue;
                }
                message
            };
            let token = uuid::Uuid::new_v4().to_string();
            state.in_flight.insert(
                token.clone(),
                InFlight {
                    queue: queue.to_string(),
                    payload: message.payload.clone(),
                    delivery_count: message.delivery_count,
                    lock_expires: now + lock_duration,
                },
            );
            return Some(Lease {
                queue: queue.to_string(),
                payload: message.payload,
                lock_token: token,
                delivery_count: message.delivery_count,
            });
        }
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn enqueue(
        &self,
        queue: &str,
        payload: String,
        delay: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let visible_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .pending
            .push(Pending {
                payload,
                delivery_count: 0,
                visible_at,
            });
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        lock_duration: Duration,
        wait: Duration,
    ) -> Result<Option<Lease>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            {
                let mut state = self.state.lock().await;
                Self::reap_expired(&mut state, now);
                if let Some(lease) = self.try_pop(&mut state, queue, lock_duration, now) {
                    return Ok(Some(lease));
                }
                // Next wakeup: earliest delayed visibility in this queue.
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let poll = Duration::from_millis(25).min(deadline - now);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    async fn complete(&self, lock_token: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(lock_token)
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownLock(lock_token.to_string()))
    }

    async fn abandon(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let flight = state
            .in_flight
            .remove(lock_token)
            .ok_or_else(|| BrokerError::UnknownLock(lock_token.to_string()))?;
        let visible_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
        state
            .queues
            .entry(flight.queue.clone())
            .or_default()
            .pending
            .push(Pending {
                payload: flight.payload,
                delivery_count: flight.delivery_count,
                visible_at,
            });
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, lock_token: &str, reason: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let flight = state
            .in_flight
            .remove(lock_token)
            .ok_or_else(|| BrokerError::UnknownLock(lock_token.to_string()))?;
        state
            .queues
            .entry(flight.queue.clone())
            .or_default()
            .dead
            .push(DeadLetter {
                queue: flight.queue,
                payload: flight.payload,
                reason: reason.to_string(),
                delivery_count: flight.delivery_count,
            });
        Ok(())
    }

    async fn renew_lock(&self, lock_token: &str, extension: Duration) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let flight = state
            .in_flight
            .get_mut(lock_token)
            .ok_or_else(|| BrokerError::UnknownLock(lock_token.to_string()))?;
        flight.lock_expires = Instant::now() + extension;
        Ok(())
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(queue)
            .map(|q| q.dead.clone())
            .unwrap_or_default())
    }

    async fn pending(&self, queue: &str) -> Result<usize, BrokerError> {
        let state = self.state.lock().await;
        let queued = state
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0);
        let in_flight = state
            .in_flight
            .values()
            .filter(|f| f.queue == queue)
            .count();
        Ok(queued + in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCK: Duration = Duration::from_secs(30);
    const WAIT: Duration = Duration::from_millis(300);

    #[tokio::test]
    async fn enqueue_receive_complete() {
        let broker = InMemoryBroker::new(10);
        broker.enqueue("q", "m1".into(), None).await.unwrap();
        let lease = broker.receive("q", LOCK, WAIT).await.unwrap().unwrap();
        assert_eq!(lease.payload, "m1");
        assert_eq!(lease.delivery_count, 1);
        broker.complete(&lease.lock_token).await.unwrap();
        assert_eq!(broker.pending("q").await.unwrap(), 0);
        assert!(broker
            .receive("q", LOCK, Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn abandon_redelivers_with_higher_count() {
        let broker = InMemoryBroker::new(10);
        broker.enqueue("q", "m1".into(), None).await.unwrap();
        let lease = broker.receive("q", LOCK, WAIT).await.unwrap().unwrap();
        broker.abandon(&lease.lock_token, None).await.unwrap();
        let lease = broker.receive("q", LOCK, WAIT).await.unwrap().unwrap();
        assert_eq!(lease.delivery_count, 2);
    }

    #[tokio::test]
    async fn visibility_delay_honored() {
        let broker = InMemoryBroker::new(10);
        broker
            .enqueue("q", "m1".into(), Some(Duration::from_millis(120)))
            .await
            .unwrap();
        assert!(broker
            .receive("q", LOCK, Duration::from_millis(30))
            .await
            .unwrap()
            .is_none());
        let lease = broker
            .receive("q", LOCK, Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.payload, "m1");
    }

    #[tokio::test]
    async fn exceeding_max_delivery_dead_letters() {
        let broker = InMemoryBroker::new(2);
        broker.enqueue("q", "poison".into(), None).await.unwrap();
        for _ in 0..2 {
            let lease = broker.receive("q", LOCK, WAIT).await.unwrap().unwrap();
            broker.abandon(&lease.lock_token, None).await.unwrap();
        }
        assert!(broker.receive("q", LOCK, WAIT).await.unwrap().is_none());
        let dead = broker.dead_letters("q").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, "poison");
        assert_eq!(dead[0].reason, "max delivery count exceeded");
    }

    #[tokio::test]
    async fn explicit_dead_letter() {
        let broker = InMemoryBroker::new(10);
        broker.enqueue("q", "bad".into(), None).await.unwrap();
        let lease = broker.receive("q", LOCK, WAIT).await.unwrap().unwrap();
        broker
            .dead_letter(&lease.lock_token, "validation")
            .await
            .unwrap();
        let dead = broker.dead_letters("q").await.unwrap();
        assert_eq!(dead[0].reason, "validation");
        assert_eq!(broker.pending("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lock_redelivers() {
        let broker = InMemoryBroker::new(10);
        broker.enqueue("q", "m1".into(), None).await.unwrap();
        let first = broker
            .receive("q", Duration::from_millis(40), WAIT)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = broker.receive("q", LOCK, WAIT).await.unwrap().unwrap();
        assert_eq!(second.payload, "m1");
        assert_eq!(second.delivery_count, 2);
        // The stale token can no longer settle the message.
        assert!(broker.complete(&first.lock_token).await.is_err());
        broker.complete(&second.lock_token).await.unwrap();
    }

    #[tokio::test]
    async fn renew_extends_lock() {
        let broker = InMemoryBroker::new(10);
        broker.enqueue("q", "m1".into(), None).await.unwrap();
        let lease = broker
            .receive("q", Duration::from_millis(60), WAIT)
            .await
            .unwrap()
            .unwrap();
        broker
            .renew_lock(&lease.lock_token, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(broker
            .receive("q", LOCK, Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
        broker.complete(&lease.lock_token).await.unwrap();
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let broker = InMemoryBroker::new(10);
        broker.enqueue("a", "for-a".into(), None).await.unwrap();
        assert!(broker
            .receive("b", LOCK, Duration::from_millis(40))
            .await
            .unwrap()
            .is_none());
        assert!(broker.receive("a", LOCK, WAIT).await.unwrap().is_some());
    }
}
