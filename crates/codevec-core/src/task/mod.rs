//! Task dispatch.

pub mod model;

use codevec_redis::TaskQueue;
use tracing::info;

use crate::error::CodevecResult;
use model::{Task, TaskHandle};

/// Queue a question for a session. Fails with a validation error when either
/// field is blank; the answer is streamed on the session channel.
pub async fn enqueue(
    queue: &dyn TaskQueue,
    query: &str,
    session_id: &str,
) -> CodevecResult<TaskHandle> {
    let task = Task::new(query, session_id)?;
    let id = queue.enqueue(task.kind(), task.kwargs()?).await?;
    info!(task_id = %id, session_id, "Task sent");
    Ok(TaskHandle::new(id))
}
