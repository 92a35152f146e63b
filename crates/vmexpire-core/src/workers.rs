//! Worker pool draining the durable task queue

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use vmexpire_store::{QueuedTask, TaskQueue};

use crate::TaskExecutor;

/// Claims before a task that keeps failing on store errors is dropped
const MAX_ATTEMPTS: u32 = 5;

/// Fixed-size pool of independent queue consumers
pub struct WorkerPool {
    workers: JoinSet<()>,
    shutdown_tx: watch::Sender<bool>,
    drain_timeout: Duration,
}

impl WorkerPool {
    pub fn start(
        size: usize,
        queue: Arc<dyn TaskQueue>,
        executor: Arc<TaskExecutor>,
        wake: Arc<Notify>,
        poll_interval: Duration,
        drain_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = JoinSet::new();

        for worker_id in 0..size {
            let worker = Worker {
                id: worker_id,
                queue: queue.clone(),
                executor: executor.clone(),
                wake: wake.clone(),
                poll_interval,
                shutdown: shutdown_rx.clone(),
            };
            workers.spawn(worker.run());
        }

        info!(size, "Worker pool started");

        Self {
            workers,
            shutdown_tx,
            drain_timeout,
        }
    }

    /// Stop claiming new tasks and wait for in-flight ones.
    ///
    /// Workers still busy after the drain timeout are aborted; their tasks
    /// stay claimed and are requeued on the next start.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);

        let drain = async {
            while let Some(result) = self.workers.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Worker panicked");
                }
            }
        };

        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!("Workers did not drain in time, aborting");
            self.workers.abort_all();
        }

        info!("Worker pool stopped");
    }
}

struct Worker {
    id: usize,
    queue: Arc<dyn TaskQueue>,
    executor: Arc<TaskExecutor>,
    wake: Arc<Notify>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = self.id, "Worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.queue.claim_next() {
                Ok(Some(queued)) => self.handle(queued).await,
                Ok(None) => {
                    if !self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(worker = self.id, error = %e, "Failed to claim task");
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }

        debug!(worker = self.id, "Worker stopped");
    }

    /// Wait for a wake-up or the poll interval; false on shutdown
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = self.wake.notified() => true,
            _ = tokio::time::sleep(self.poll_interval) => true,
            _ = self.shutdown.changed() => !*self.shutdown.borrow(),
        }
    }

    async fn handle(&self, queued: QueuedTask) {
        let QueuedTask {
            id, task, attempts, ..
        } = queued;
        let vm_id = task.vm_id().clone();
        let kind = task.kind();

        match self.executor.execute(task).await {
            Ok(()) => {
                debug!(worker = self.id, task_id = %id, task = kind, vm_id = %vm_id, "Task done");
            }
            Err(e) if e.is_requeueable() && attempts < MAX_ATTEMPTS => {
                warn!(
                    worker = self.id,
                    task_id = %id,
                    task = kind,
                    vm_id = %vm_id,
                    attempts,
                    error = %e,
                    "Task failed, requeueing"
                );
                if let Err(e) = self.queue.release(id) {
                    error!(task_id = %id, error = %e, "Failed to requeue task");
                }
                tokio::time::sleep(self.poll_interval).await;
                return;
            }
            Err(e) => {
                // Delete failures already put the record back for the next sweep
                warn!(
                    worker = self.id,
                    task_id = %id,
                    task = kind,
                    vm_id = %vm_id,
                    error = %e,
                    "Task failed"
                );
            }
        }

        if let Err(e) = self.queue.ack(id) {
            error!(task_id = %id, error = %e, "Failed to ack task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{t0, Harness};
    use crate::{QueuedDispatcher, TaskDispatcher};
    use chrono::Duration as ChronoDuration;
    use vmexpire_api::{Task, VmStatus};
    use vmexpire_config::ExpirationPolicy;
    use vmexpire_store::{SqliteStore, Store};
    use vmexpire_util::{ProjectId, VmId};

    fn queued_harness() -> (Harness, Arc<dyn TaskQueue>, Arc<Notify>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let queue: Arc<dyn TaskQueue> = store.clone();
        let mut wake = None;
        let h = Harness::with_dispatcher(ExpirationPolicy::default(), store, |_, events| {
            let dispatcher = QueuedDispatcher::new(queue.clone(), events.clone());
            wake = Some(dispatcher.wake_handle());
            Arc::new(dispatcher)
        });
        (h, queue, wake.unwrap())
    }

    async fn wait_for(h: &Harness, vm_id: &VmId, status: VmStatus) {
        for _ in 0..200 {
            if h.store.get_vm(vm_id).unwrap().map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{vm_id} never reached {status}");
    }

    #[tokio::test]
    async fn pool_runs_queued_lifecycle() {
        let (h, queue, wake) = queued_harness();
        let pool = WorkerPool::start(
            2,
            queue.clone(),
            h.executor.clone(),
            wake,
            Duration::from_millis(20),
            Duration::from_secs(1),
        );

        let vm_id = VmId::new("vm-1");
        h.engine
            .dispatcher()
            .submit(Task::RegisterCreated {
                vm_id: vm_id.clone(),
                project_id: ProjectId::new("proj"),
                created_at: t0(),
            })
            .await
            .unwrap();
        wait_for(&h, &vm_id, VmStatus::Active).await;

        h.engine.run_once(t0() + ChronoDuration::days(50)).await;
        h.engine.run_once(t0() + ChronoDuration::days(60)).await;
        h.clock.set(t0() + ChronoDuration::days(61));
        let report = h.engine.run_once(t0() + ChronoDuration::days(61)).await;
        assert_eq!(report.summary.deletions_dispatched, 1);

        wait_for(&h, &vm_id, VmStatus::Deleted).await;
        pool.shutdown().await;

        assert_eq!(h.deleter.deleted(), vec![vm_id]);
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_delete_is_acked_and_rolled_back() {
        let (h, queue, wake) = queued_harness();
        let vm_id = h.register("vm-1", "proj").await;
        h.engine.run_once(t0() + ChronoDuration::days(50)).await;
        h.engine.run_once(t0() + ChronoDuration::days(60)).await;
        h.engine.run_once(t0() + ChronoDuration::days(61)).await;
        assert_eq!(h.record(&vm_id).status, VmStatus::Deleting);

        h.deleter.set_failure(Some(vmexpire_adapter_api::AdapterError::Unavailable(
            "compute down".into(),
        )));
        let pool = WorkerPool::start(
            1,
            queue.clone(),
            h.executor.clone(),
            wake,
            Duration::from_millis(20),
            Duration::from_secs(1),
        );

        wait_for(&h, &vm_id, VmStatus::Expired).await;
        pool.shutdown().await;

        assert!(h.deleter.deleted().is_empty());
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_with_idle_workers_is_prompt() {
        let (h, queue, wake) = queued_harness();
        let pool = WorkerPool::start(
            3,
            queue,
            h.executor.clone(),
            wake,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        tokio::time::timeout(Duration::from_secs(1), pool.shutdown())
            .await
            .expect("idle pool should stop immediately");
    }
}
