//! Durable task queue.
//!
//! Rows live in Redis lists. A consumer atomically moves a row from the
//! pending list to the processing list (`BLMOVE`), so each row is taken by
//! exactly one worker. Failed rows are retried a bounded number of times and
//! then parked on a dead-letter list. Each taken row is stamped with its
//! claim time; rows held past the visibility timeout by a consumer that
//! died are swept back through the same retry policy.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Direction};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::{RedisPool, RedisResult};

/// Retries granted to a task after its first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Failure reason recorded on rows recovered from a lost consumer.
pub const LOST_CONSUMER_REASON: &str = "consumer lost before settling the task";

// KEYS: processing, target, claims. ARGV: taken row, next row, task id.
// Moves the row only while it is still in processing, so a nack and a
// stale sweep racing on the same row settle it once.
const RECLAIM_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
  redis.call('LPUSH', KEYS[2], ARGV[2])
  redis.call('HDEL', KEYS[3], ARGV[3])
  return 1
end
return 0
"#;

/// A task row as stored on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: String,
    pub name: String,
    pub kwargs: serde_json::Value,
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedTask {
    pub fn new(name: &str, kwargs: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            kwargs,
            attempts: 0,
            enqueued_at: chrono::Utc::now().to_rfc3339(),
            last_error: None,
        }
    }
}

/// A row handed to one consumer. It must be acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: QueuedTask,
    raw: String,
}

impl Delivery {
    pub(crate) fn new(task: QueuedTask, raw: String) -> Self {
        Self { task, raw }
    }
}

/// What happened to a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { attempts: u32 },
    DeadLettered,
}

/// Work distribution with at-most-one consumer per row.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a task. Returns the task id, useful only for log correlation.
    async fn enqueue(&self, name: &str, kwargs: serde_json::Value) -> RedisResult<String>;

    /// Take the next row, waiting at most `wait`.
    async fn dequeue(&self, wait: Duration) -> RedisResult<Option<Delivery>>;

    /// Mark a delivery as done.
    async fn ack(&self, delivery: &Delivery) -> RedisResult<()>;

    /// Mark a delivery as failed and apply the retry policy.
    async fn nack(&self, delivery: &Delivery, reason: &str) -> RedisResult<NackOutcome>;

    /// Number of rows waiting to be taken.
    async fn depth(&self) -> RedisResult<usize>;

    /// Rows that exhausted their retries.
    async fn dead_letters(&self) -> RedisResult<Vec<QueuedTask>>;

    /// Settle rows held longer than `visibility` as failed, as if their
    /// consumer had nacked them. Returns how many rows were recovered.
    async fn requeue_stale(&self, visibility: Duration) -> RedisResult<usize>;
}

/// Decide the next state of a failed row.
pub(crate) fn apply_failure(
    task: &QueuedTask,
    reason: &str,
    max_retries: u32,
) -> (QueuedTask, NackOutcome) {
    let mut next = task.clone();
    next.attempts += 1;
    next.last_error = Some(reason.to_string());
    let outcome = if next.attempts <= max_retries {
        NackOutcome::Requeued {
            attempts: next.attempts,
        }
    } else {
        NackOutcome::DeadLettered
    };
    (next, outcome)
}

/// Redis list-backed queue.
pub struct RedisTaskQueue {
    client: redis::Client,
    pool: RedisPool,
    pending_key: String,
    processing_key: String,
    claims_key: String,
    dead_key: String,
    max_retries: u32,
    // Blocking pops get their own connections so they never stall the
    // multiplexed pool used by ack/nack/publish.
    idle: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisTaskQueue {
    /// Open the queue named `queue` on the Redis server at `redis_url`.
    pub async fn connect(redis_url: &str, queue: &str, max_retries: u32) -> RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let pool = RedisPool::new(client.clone()).await?;
        let pending_key = format!("codevec:queue:{}", queue);
        Ok(Self {
            client,
            pool,
            processing_key: format!("{}:processing", pending_key),
            claims_key: format!("{}:claims", pending_key),
            dead_key: format!("{}:dead", pending_key),
            pending_key,
            max_retries,
            idle: Mutex::new(Vec::new()),
        })
    }

    async fn blocking_conn(&self) -> RedisResult<MultiplexedConnection> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, name: &str, kwargs: serde_json::Value) -> RedisResult<String> {
        let row = QueuedTask::new(name, kwargs);
        let json = serde_json::to_string(&row)?;
        let mut conn = self.pool.clone();
        conn.lpush::<_, _, ()>(&self.pending_key, &json).await?;
        debug!(task_id = %row.id, queue = %self.pending_key, "Enqueued task");
        Ok(row.id)
    }

    async fn dequeue(&self, wait: Duration) -> RedisResult<Option<Delivery>> {
        let mut conn = self.blocking_conn().await?;
        let raw: Option<String> = conn
            .blmove(
                &self.pending_key,
                &self.processing_key,
                Direction::Right,
                Direction::Left,
                // A zero timeout would block forever.
                wait.as_secs_f64().max(0.01),
            )
            .await?;
        self.idle.lock().await.push(conn);

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<QueuedTask>(&raw) {
            Ok(task) => {
                let mut conn = self.pool.clone();
                let claimed_at = chrono::Utc::now().timestamp_millis();
                conn.hset::<_, _, _, ()>(&self.claims_key, &task.id, claimed_at)
                    .await?;
                Ok(Some(Delivery::new(task, raw)))
            }
            Err(e) => {
                warn!(error = %e, "Unreadable queue row, moving to dead-letter list");
                let mut conn = self.pool.clone();
                let _: () = redis::pipe()
                    .atomic()
                    .lrem(&self.processing_key, 1, &raw)
                    .ignore()
                    .lpush(&self.dead_key, &raw)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> RedisResult<()> {
        let mut conn = self.pool.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(&self.processing_key, 1, &delivery.raw)
            .ignore()
            .hdel(&self.claims_key, &delivery.task.id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> RedisResult<NackOutcome> {
        let (next, outcome) = apply_failure(&delivery.task, reason, self.max_retries);
        let json = serde_json::to_string(&next)?;
        let target = match outcome {
            NackOutcome::Requeued { .. } => &self.pending_key,
            NackOutcome::DeadLettered => &self.dead_key,
        };

        let mut conn = self.pool.clone();
        let moved: i64 = redis::Script::new(RECLAIM_SCRIPT)
            .key(&self.processing_key)
            .key(target)
            .key(&self.claims_key)
            .arg(&delivery.raw)
            .arg(json)
            .arg(&delivery.task.id)
            .invoke_async(&mut conn)
            .await?;
        if moved == 0 {
            debug!(task_id = %delivery.task.id, "Delivery already settled");
        }
        Ok(outcome)
    }

    async fn depth(&self) -> RedisResult<usize> {
        let mut conn = self.pool.clone();
        Ok(conn.llen(&self.pending_key).await?)
    }

    async fn dead_letters(&self) -> RedisResult<Vec<QueuedTask>> {
        let mut conn = self.pool.clone();
        let rows: Vec<String> = conn.lrange(&self.dead_key, 0, -1).await?;
        Ok(rows
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    async fn requeue_stale(&self, visibility: Duration) -> RedisResult<usize> {
        let mut conn = self.pool.clone();
        let rows: Vec<String> = conn.lrange(&self.processing_key, 0, -1).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let claims: HashMap<String, i64> = conn.hgetall(&self.claims_key).await?;
        let now = chrono::Utc::now().timestamp_millis();
        let cutoff = now.saturating_sub(i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX));
        let script = redis::Script::new(RECLAIM_SCRIPT);

        let mut recovered = 0;
        for raw in rows {
            let Ok(task) = serde_json::from_str::<QueuedTask>(&raw) else {
                continue;
            };
            match claims.get(&task.id) {
                // Moved but not stamped yet; start its clock now.
                None => {
                    conn.hset_nx::<_, _, _, ()>(&self.claims_key, &task.id, now)
                        .await?;
                }
                Some(&claimed_at) if claimed_at <= cutoff => {
                    let (next, outcome) =
                        apply_failure(&task, LOST_CONSUMER_REASON, self.max_retries);
                    let target = match outcome {
                        NackOutcome::Requeued { .. } => &self.pending_key,
                        NackOutcome::DeadLettered => &self.dead_key,
                    };
                    let moved: i64 = script
                        .key(&self.processing_key)
                        .key(target)
                        .key(&self.claims_key)
                        .arg(&raw)
                        .arg(serde_json::to_string(&next)?)
                        .arg(&task.id)
                        .invoke_async(&mut conn)
                        .await?;
                    if moved == 1 {
                        warn!(task_id = %task.id, ?outcome, "Recovered task from a lost consumer");
                        recovered += 1;
                    }
                }
                Some(_) => {}
            }
        }
        Ok(recovered)
    }
}
