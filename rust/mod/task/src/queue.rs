//! Per-task bounded work queue.
//!
//! A queue is built for exactly one run of one task. Units are admitted
//! through a semaphore with `thread_count` permits and executed on a
//! `JoinSet`; lifecycle events go out on an unbounded channel to a single
//! consumer. Destroying the queue cancels everything at once: queued units
//! never start, in-flight units are aborted, and no further events are sent.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use autopilot_core::ServiceError;

use crate::error::{code, ScriptError};
use crate::model::{TaskUnit, UnitId};
use crate::worker::UnitRunner;

/// What the queue reports about its units.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Started(UnitId),
    Progress {
        unit: UnitId,
        completed: usize,
        total: usize,
    },
    Finished(UnitId),
    Failed {
        unit: UnitId,
        error: ScriptError,
    },
    /// Nothing pending or in flight. Sent once, after every unit event.
    Drained { task_id: String },
}

pub struct TaskQueue {
    task_id: String,
    concurrency: usize,
    runner: Arc<dyn UnitRunner>,
    events: mpsc::UnboundedSender<QueueEvent>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Build an idle queue and the receiving end of its event stream.
    /// A concurrency of zero is raised to one.
    pub fn new(
        task_id: &str,
        concurrency: usize,
        runner: Arc<dyn UnitRunner>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            task_id: task_id.to_string(),
            concurrency: concurrency.max(1),
            runner,
            events: tx,
            cancel: CancellationToken::new(),
            driver: Mutex::new(None),
        });
        (queue, rx)
    }

    /// Token cancelled by [`destroy`](Self::destroy).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Hand the queue its units and start running them. Only one batch is
    /// accepted per queue.
    pub fn add_bulk(&self, units: Vec<TaskUnit>) -> Result<(), ServiceError> {
        if self.is_destroyed() {
            return Err(ServiceError::Validation(format!(
                "queue for task {} is destroyed",
                self.task_id
            )));
        }
        let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        if driver.is_some() {
            return Err(ServiceError::Conflict(format!(
                "queue for task {} already has its units",
                self.task_id
            )));
        }

        info!(
            task = %self.task_id,
            units = units.len(),
            concurrency = self.concurrency,
            "queue started"
        );
        *driver = Some(tokio::spawn(drive(
            self.task_id.clone(),
            self.concurrency,
            Arc::clone(&self.runner),
            self.events.clone(),
            self.cancel.clone(),
            units,
        )));
        Ok(())
    }

    /// Cancel the queue. Idempotent.
    pub fn destroy(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(driver) = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            driver.abort();
        }
        info!(task = %self.task_id, "queue destroyed");
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(
    task_id: String,
    concurrency: usize,
    runner: Arc<dyn UnitRunner>,
    events: mpsc::UnboundedSender<QueueEvent>,
    cancel: CancellationToken,
    units: Vec<TaskUnit>,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut running = JoinSet::new();

    // Dropping `running` on an early return aborts every unit in it.
    for unit in units {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };
        let runner = Arc::clone(&runner);
        let events = events.clone();
        let cancel = cancel.clone();
        running.spawn(async move {
            let _permit = permit;
            run_unit(runner, unit, events, cancel).await;
        });
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            joined = running.join_next() => match joined {
                None => break,
                Some(Err(e)) if e.is_panic() => error!(task = %task_id, "unit task panicked: {e}"),
                Some(_) => {}
            },
        }
    }

    if !cancel.is_cancelled() {
        debug!(task = %task_id, "queue drained");
        let _ = events.send(QueueEvent::Drained { task_id });
    }
}

async fn run_unit(
    runner: Arc<dyn UnitRunner>,
    unit: TaskUnit,
    events: mpsc::UnboundedSender<QueueEvent>,
    cancel: CancellationToken,
) {
    let emit = |event: QueueEvent| {
        if !cancel.is_cancelled() {
            let _ = events.send(event);
        }
    };

    emit(QueueEvent::Started(unit.id.clone()));

    let progress = |completed: usize, total: usize| {
        emit(QueueEvent::Progress {
            unit: unit.id.clone(),
            completed,
            total,
        })
    };
    let outcome = AssertUnwindSafe(runner.run(&unit, &progress))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => emit(QueueEvent::Finished(unit.id.clone())),
        Ok(Err(error)) => emit(QueueEvent::Failed {
            unit: unit.id.clone(),
            error,
        }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            error!(unit = %unit.id, "worker panicked: {message}");
            emit(QueueEvent::Failed {
                unit: unit.id.clone(),
                error: ScriptError::new(code::WORKER_PANIC, message),
            });
        }
    }
}
