use std::sync::Arc;

use tracing::{debug, info, warn};

use autopilot_core::{now_rfc3339, ServiceError};

use crate::model::TaskStatus;
use crate::queue::QueueEvent;
use crate::store::{TaskLogStore, TaskStore};

/// Persists queue events into task logs and the task record.
///
/// Every write is best-effort: a storage failure is logged and dropped so
/// bookkeeping can never stall or break the queue.
pub struct LifecycleReducer {
    tasks: Arc<TaskStore>,
    logs: Arc<TaskLogStore>,
}

impl LifecycleReducer {
    pub fn new(tasks: Arc<TaskStore>, logs: Arc<TaskLogStore>) -> Self {
        Self { tasks, logs }
    }

    pub fn apply(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Started(unit) => {
                debug!(%unit, "unit started");
                let result = self
                    .logs
                    .ensure(unit)
                    .and_then(|_| self.logs.mark_running(unit, "started"));
                best_effort("mark unit running", result);
            }
            QueueEvent::Progress {
                unit,
                completed,
                total,
            } => {
                let line = format!("progress {completed}/{total}");
                best_effort("append unit progress", self.logs.append(unit, &line));
            }
            QueueEvent::Finished(unit) => {
                info!(%unit, "unit completed");
                best_effort("mark unit completed", self.logs.mark_completed(unit, "completed"));
            }
            QueueEvent::Failed { unit, error } => {
                warn!(%unit, code = error.code, "unit failed: {}", error.message);
                let line = format!("failed: {error}");
                best_effort(
                    "mark unit failed",
                    self.logs
                        .mark_failed(unit, error.code, &error.message, &line),
                );
            }
            QueueEvent::Drained { task_id } => {
                let result = self.tasks.transition(task_id, &[TaskStatus::Running], |t| {
                    t.status = TaskStatus::Completed;
                    t.ended_at = Some(now_rfc3339());
                });
                match result {
                    Ok(Some(_)) => info!(task = %task_id, "task completed"),
                    Ok(None) => debug!(task = %task_id, "drained task no longer running"),
                    Err(e) => warn!(task = %task_id, "mark task completed failed: {e}"),
                }
            }
        }
    }
}

fn best_effort(what: &str, result: Result<(), ServiceError>) {
    if let Err(e) = result {
        warn!("{what} failed: {e}");
    }
}
