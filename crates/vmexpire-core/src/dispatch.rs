//! Task dispatchers
//!
//! The engine only sees [`TaskDispatcher`]. Which implementation sits behind
//! it is decided once at startup from the dispatch mode.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info};
use vmexpire_api::Task;
use vmexpire_store::TaskQueue;

use crate::{CoreEvent, DispatchError, DispatchResult, EventSink, TaskExecutor};

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Hand over a task. Fire-and-forget: success means the task was
    /// accepted, not that its side effects happened.
    async fn submit(&self, task: Task) -> DispatchResult<()>;

    /// False once the dispatcher has refused work
    fn is_healthy(&self) -> bool;

    /// Tasks waiting to run, when the dispatcher queues
    fn queue_depth(&self) -> Option<u64>;
}

/// Runs each task before `submit` returns
pub struct InlineDispatcher {
    executor: Arc<TaskExecutor>,
}

impl InlineDispatcher {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TaskDispatcher for InlineDispatcher {
    async fn submit(&self, task: Task) -> DispatchResult<()> {
        self.executor
            .execute(task)
            .await
            .map_err(|e| DispatchError::Execution(Box::new(e)))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn queue_depth(&self) -> Option<u64> {
        None
    }
}

/// Writes tasks to the durable queue for the worker pool
pub struct QueuedDispatcher {
    queue: Arc<dyn TaskQueue>,
    wake: Arc<Notify>,
    healthy: AtomicBool,
    events: EventSink,
}

impl QueuedDispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>, events: EventSink) -> Self {
        Self {
            queue,
            wake: Arc::new(Notify::new()),
            healthy: AtomicBool::new(true),
            events,
        }
    }

    /// Signal workers wait on for new work
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }
}

#[async_trait]
impl TaskDispatcher for QueuedDispatcher {
    async fn submit(&self, task: Task) -> DispatchResult<()> {
        match self.queue.enqueue(&task) {
            Ok(id) => {
                if !self.healthy.swap(true, Ordering::SeqCst) {
                    info!("Task queue accepting work again");
                }
                debug!(task_id = %id, task = task.kind(), vm_id = %task.vm_id(), "Task queued");
                self.wake.notify_one();
                Ok(())
            }
            Err(e) => {
                if self.healthy.swap(false, Ordering::SeqCst) {
                    error!(error = %e, "Task queue unavailable");
                    self.events.emit(CoreEvent::DispatcherUnhealthy {
                        error: e.to_string(),
                    });
                }
                Err(DispatchError::Unavailable(e.to_string()))
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn queue_depth(&self) -> Option<u64> {
        self.queue.pending_count().ok()
    }
}
