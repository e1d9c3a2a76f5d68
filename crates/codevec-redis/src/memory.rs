//! In-process broker and queue.
//!
//! Same semantics as the Redis implementations, plus fault injection hooks
//! (severed links, refused subscribes, failed publishes) for exercising the
//! recovery paths without a real server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, warn};

use crate::broker::{Broker, Subscription};
use crate::client::{RedisError, RedisResult};
use crate::queue::{
    apply_failure, Delivery, NackOutcome, QueuedTask, TaskQueue, LOST_CONSUMER_REASON,
};

/// Per-channel buffer, matching the capacity used for in-process fan-out.
const CHANNEL_CAPACITY: usize = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct BrokerState {
    channels: HashMap<String, broadcast::Sender<String>>,
    history: HashMap<String, Vec<String>>,
}

/// In-memory pub/sub broker. Clones share the same channels.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    link: watch::Sender<u64>,
    refuse_subscribes: AtomicU32,
    fail_publishes: AtomicU32,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (link, _) = watch::channel(0);
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                link,
                refuse_subscribes: AtomicU32::new(0),
                fail_publishes: AtomicU32::new(0),
                subscribes: AtomicUsize::new(0),
                unsubscribes: AtomicUsize::new(0),
            }),
        }
    }

    /// Break every live subscription. Their next poll fails with a link error
    /// and anything published afterwards is not delivered to them.
    pub fn sever(&self) {
        self.inner.link.send_modify(|generation| *generation += 1);
        debug!("Severed all memory broker links");
    }

    /// Make the next `n` subscribe attempts fail.
    pub fn refuse_subscribes(&self, n: u32) {
        self.inner.refuse_subscribes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` publishes fail.
    pub fn fail_publishes(&self, n: u32) {
        self.inner.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Successful subscribe calls so far.
    pub fn subscribe_count(&self) -> usize {
        self.inner.subscribes.load(Ordering::SeqCst)
    }

    /// Unsubscribe calls so far.
    pub fn unsubscribe_count(&self) -> usize {
        self.inner.unsubscribes.load(Ordering::SeqCst)
    }

    /// Every payload successfully published on `channel`, in order.
    pub fn published(&self, channel: &str) -> Vec<String> {
        lock(&self.inner.state)
            .history
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> RedisResult<()> {
        if Self::take_fault(&self.inner.fail_publishes) {
            return Err(RedisError::LinkLost("injected publish failure".into()));
        }
        let mut state = lock(&self.inner.state);
        state
            .history
            .entry(channel.to_string())
            .or_default()
            .push(payload.to_string());
        if let Some(tx) = state.channels.get(channel) {
            // No receivers is fine: nobody is listening right now.
            let _ = tx.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> RedisResult<Box<dyn Subscription>> {
        if Self::take_fault(&self.inner.refuse_subscribes) {
            return Err(RedisError::LinkLost("injected subscribe failure".into()));
        }
        let rx = lock(&self.inner.state)
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let link = self.inner.link.subscribe();
        let generation = *link.borrow();
        self.inner.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription {
            channel: channel.to_string(),
            broker: self.clone(),
            rx,
            link,
            generation,
        }))
    }
}

struct MemorySubscription {
    channel: String,
    broker: MemoryBroker,
    rx: broadcast::Receiver<String>,
    link: watch::Receiver<u64>,
    generation: u64,
}

impl MemorySubscription {
    fn link_lost(&self) -> RedisError {
        RedisError::LinkLost(format!("memory link for {} severed", self.channel))
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_message(&mut self, wait: Duration) -> RedisResult<Option<String>> {
        if *self.link.borrow() != self.generation {
            return Err(self.link_lost());
        }

        let rx = &mut self.rx;
        let link = &mut self.link;
        let channel = self.channel.as_str();
        let recv = async {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Ok(payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel, skipped, "Memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(RedisError::LinkLost(format!("{} closed", channel)));
                    }
                }
            }
        };

        let result = tokio::select! {
            _ = link.changed() => None,
            res = tokio::time::timeout(wait, recv) => Some(res),
        };

        match result {
            None => Err(self.link_lost()),
            Some(Err(_elapsed)) => Ok(None),
            Some(Ok(res)) => res.map(Some),
        }
    }

    async fn unsubscribe(&mut self) -> RedisResult<()> {
        self.broker.inner.unsubscribes.fetch_add(1, Ordering::SeqCst);
        debug!(channel = %self.channel, "Unsubscribed memory subscription");
        Ok(())
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedTask>,
    // Task id to the row and when it was taken.
    processing: HashMap<String, (QueuedTask, tokio::time::Instant)>,
    dead: Vec<QueuedTask>,
}

/// In-memory task queue with the same retry and dead-letter policy as
/// [`crate::queue::RedisTaskQueue`].
pub struct MemoryTaskQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    max_retries: u32,
}

impl MemoryTaskQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            max_retries,
        }
    }

    /// Rows currently handed out and not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        lock(&self.state).processing.len()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, name: &str, kwargs: serde_json::Value) -> RedisResult<String> {
        let row = QueuedTask::new(name, kwargs);
        let id = row.id.clone();
        lock(&self.state).pending.push_back(row);
        self.ready.notify_one();
        Ok(id)
    }

    async fn dequeue(&self, wait: Duration) -> RedisResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut state = lock(&self.state);
                if let Some(task) = state.pending.pop_front() {
                    let claimed_at = tokio::time::Instant::now();
                    state
                        .processing
                        .insert(task.id.clone(), (task.clone(), claimed_at));
                    let raw = serde_json::to_string(&task)?;
                    return Ok(Some(Delivery::new(task, raw)));
                }
            }
            if tokio::time::timeout_at(deadline, self.ready.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> RedisResult<()> {
        lock(&self.state).take_claim(delivery);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> RedisResult<NackOutcome> {
        let (next, outcome) = apply_failure(&delivery.task, reason, self.max_retries);
        {
            let mut state = lock(&self.state);
            if !state.take_claim(delivery) {
                debug!(task_id = %delivery.task.id, "Delivery already settled");
                return Ok(outcome);
            }
            state.settle(next, outcome);
        }
        if matches!(outcome, NackOutcome::Requeued { .. }) {
            self.ready.notify_one();
        }
        Ok(outcome)
    }

    async fn depth(&self) -> RedisResult<usize> {
        Ok(lock(&self.state).pending.len())
    }

    async fn dead_letters(&self) -> RedisResult<Vec<QueuedTask>> {
        Ok(lock(&self.state).dead.clone())
    }

    async fn requeue_stale(&self, visibility: Duration) -> RedisResult<usize> {
        let now = tokio::time::Instant::now();
        let mut requeued = 0;
        let recovered = {
            let mut state = lock(&self.state);
            let stale: Vec<String> = state
                .processing
                .iter()
                .filter(|(_, (_, claimed_at))| now.duration_since(*claimed_at) >= visibility)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                if let Some((task, _)) = state.processing.remove(id) {
                    let (next, outcome) =
                        apply_failure(&task, LOST_CONSUMER_REASON, self.max_retries);
                    warn!(task_id = %id, ?outcome, "Recovered task from a lost consumer");
                    if matches!(outcome, NackOutcome::Requeued { .. }) {
                        requeued += 1;
                    }
                    state.settle(next, outcome);
                }
            }
            stale.len()
        };
        for _ in 0..requeued {
            self.ready.notify_one();
        }
        Ok(recovered)
    }
}

impl QueueState {
    /// Drop the claim held by `delivery`. False when the row was already
    /// settled, including by a stale sweep that handed it to someone else.
    fn take_claim(&mut self, delivery: &Delivery) -> bool {
        let held = self
            .processing
            .get(&delivery.task.id)
            .is_some_and(|(task, _)| task.attempts == delivery.task.attempts);
        if held {
            self.processing.remove(&delivery.task.id);
        }
        held
    }

    fn settle(&mut self, next: QueuedTask, outcome: NackOutcome) {
        match outcome {
            NackOutcome::Requeued { .. } => self.pending.push_back(next),
            NackOutcome::DeadLettered => self.dead.push(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_subscriber_receives_messages_in_publish_order() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("stream:s1").await.unwrap();

        broker.publish("stream:s1", "one").await.unwrap();
        broker.publish("stream:s1", "two").await.unwrap();

        assert_eq!(sub.next_message(WAIT).await.unwrap().as_deref(), Some("one"));
        assert_eq!(sub.next_message(WAIT).await.unwrap().as_deref(), Some("two"));
        assert_eq!(sub.next_message(WAIT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_messages() {
        let broker = MemoryBroker::new();
        broker.publish("stream:s1", "early").await.unwrap();

        let mut sub = broker.subscribe("stream:s1").await.unwrap();
        assert_eq!(sub.next_message(WAIT).await.unwrap(), None);
        assert_eq!(broker.published("stream:s1"), vec!["early".to_string()]);
    }

    #[tokio::test]
    async fn test_sever_breaks_existing_subscriptions_only() {
        let broker = MemoryBroker::new();
        let mut old = broker.subscribe("stream:s1").await.unwrap();

        broker.sever();
        let err = old.next_message(WAIT).await.unwrap_err();
        assert!(err.is_transient());

        let mut fresh = broker.subscribe("stream:s1").await.unwrap();
        broker.publish("stream:s1", "after").await.unwrap();
        assert_eq!(fresh.next_message(WAIT).await.unwrap().as_deref(), Some("after"));
        assert_eq!(broker.subscribe_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let broker = MemoryBroker::new();
        broker.refuse_subscribes(1);
        broker.fail_publishes(1);

        assert!(broker.subscribe("c").await.is_err());
        assert!(broker.subscribe("c").await.is_ok());
        assert!(broker.publish("c", "x").await.is_err());
        assert!(broker.publish("c", "x").await.is_ok());
        assert_eq!(broker.published("c").len(), 1);
    }

    #[tokio::test]
    async fn test_queue_is_fifo_and_single_delivery() {
        let queue = MemoryTaskQueue::new(3);
        let first = queue.enqueue("process_task", serde_json::json!({"n": 1})).await.unwrap();
        queue.enqueue("process_task", serde_json::json!({"n": 2})).await.unwrap();

        let delivery = queue.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.task.id, first);
        assert_eq!(queue.depth().await.unwrap(), 1);
        assert_eq!(queue.in_flight(), 1);

        queue.ack(&delivery).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_queue_dequeue_times_out_when_empty() {
        let queue = MemoryTaskQueue::new(3);
        assert!(queue.dequeue(WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_wakes_waiting_consumer() {
        let queue = Arc::new(MemoryTaskQueue::new(3));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue("process_task", serde_json::json!({})).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap();
        assert!(delivery.is_some());
    }

    #[tokio::test]
    async fn test_nack_dead_letters_after_retries() {
        let queue = MemoryTaskQueue::new(1);
        queue.enqueue("process_task", serde_json::json!({})).await.unwrap();

        let d = queue.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(
            queue.nack(&d, "first").await.unwrap(),
            NackOutcome::Requeued { attempts: 1 }
        );
        let d = queue.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(queue.nack(&d, "second").await.unwrap(), NackOutcome::DeadLettered);

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rows_held_past_visibility_are_requeued() {
        let queue = MemoryTaskQueue::new(3);
        let id = queue.enqueue("process_task", serde_json::json!({})).await.unwrap();

        // Taken by a consumer that never settles it.
        let abandoned = queue.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(queue.requeue_stale(Duration::from_secs(60)).await.unwrap(), 0);
        assert_eq!(queue.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.requeue_stale(Duration::from_millis(10)).await.unwrap(), 1);
        assert_eq!(queue.in_flight(), 0);

        let retry = queue.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(retry.task.id, id);
        assert_eq!(retry.task.attempts, 1);
        assert_eq!(retry.task.last_error.as_deref(), Some(LOST_CONSUMER_REASON));

        // The lost consumer settling late neither clears the new claim nor
        // queues a second copy.
        queue.nack(&abandoned, "late").await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.in_flight(), 1);
        queue.ack(&retry).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stale_rows_past_retries_are_dead_lettered() {
        let queue = MemoryTaskQueue::new(0);
        queue.enqueue("process_task", serde_json::json!({})).await.unwrap();
        let _abandoned = queue.dequeue(WAIT).await.unwrap().unwrap();

        assert_eq!(queue.requeue_stale(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some(LOST_CONSUMER_REASON));
    }
}
