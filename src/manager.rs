// src/manager.rs

use crate::config::{ConfigError, ManagerConfig};
use crate::downloader::DownloadWorker;
use crate::models::{CancelOutcome, TaskId, TaskSnapshot, TaskStatus};
use crate::observer::DownloadObserver;
use crate::task::DownloadTask;
use crate::transfer::{SimulatedTransfers, TransferFactory};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("a download manager must be created inside a tokio runtime")]
    NoRuntime,
    #[error("download manager is shutting down")]
    ShuttingDown,
}

/// Accepts downloads and runs them on a fixed-size pool of workers.
///
/// Submissions are admitted in FIFO order. When every slot is busy, new
/// tasks stay `Pending` until a slot frees up; nothing is rejected while the
/// manager is accepting work.
///
/// Shutdown policy: [`shutdown`](Self::shutdown) drains, letting every
/// admitted task finish; [`shutdown_now`](Self::shutdown_now) cancels every
/// unfinished task first. Dropping the manager without shutting it down
/// behaves like `shutdown` without waiting.
pub struct DownloadManager {
    config: ManagerConfig,
    transfers: Arc<dyn TransferFactory>,
    tasks: RwLock<HashMap<TaskId, Arc<DownloadTask>>>,
    next_task_id: AtomicU64,
    // `None` once shutdown has begun.
    queue: Mutex<Option<mpsc::UnboundedSender<DownloadWorker>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Creates a manager running simulated transfers described by `config`.
    pub fn new(config: ManagerConfig) -> Result<Self, ManagerError> {
        let mut transfers = SimulatedTransfers::new(config.max_increment, config.failure_rate);
        if let Some(seed) = config.seed {
            transfers = transfers.seeded(seed);
        }
        Self::with_transfers(config, Arc::new(transfers))
    }

    /// Creates a manager whose tasks are driven by `transfers`.
    pub fn with_transfers(
        config: ManagerConfig,
        transfers: Arc<dyn TransferFactory>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(config.max_concurrent_downloads));
        let dispatcher = runtime.spawn(dispatch(queue_rx, slots));
        info!(
            workers = config.max_concurrent_downloads,
            interval_ms = config.tick_interval_ms,
            "download manager started"
        );

        Ok(Self {
            config,
            transfers,
            tasks: RwLock::new(HashMap::new()),
            next_task_id: AtomicU64::new(1),
            queue: Mutex::new(Some(queue_tx)),
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_accepting(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Registers a new download and queues it for a worker. Returns without
    /// waiting for the download to start.
    pub fn submit(
        &self,
        url: impl Into<String>,
        observer: Arc<dyn DownloadObserver>,
    ) -> Result<TaskId, ManagerError> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = queue.as_ref() else {
            return Err(ManagerError::ShuttingDown);
        };

        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst));
        let task = Arc::new(DownloadTask::new(id, url));
        task.register_observer(observer);
        let transfer = self.transfers.open(task.url());
        let worker = DownloadWorker::new(task.clone(), transfer, self.config.tick_interval());

        self.write_tasks().insert(id, task.clone());
        if queue.send(worker).is_err() {
            self.write_tasks().remove(&id);
            return Err(ManagerError::ShuttingDown);
        }

        info!(task = %id, url = task.url(), "task submitted");
        Ok(id)
    }

    /// Requests cooperative cancellation. Never waits for the worker.
    pub fn cancel(&self, id: TaskId) -> CancelOutcome {
        let Some(task) = self.task(id) else {
            debug!(task = %id, "cancel ignored: unknown task");
            return CancelOutcome::NotFound;
        };
        match task.cancel() {
            Ok(()) => CancelOutcome::Canceled,
            Err(status) => {
                debug!(task = %id, %status, "cancel ignored: task already finished");
                CancelOutcome::AlreadyTerminal(status)
            }
        }
    }

    /// Current status, or `None` when no task has this id.
    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.task(id).map(|task| task.status())
    }

    pub fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.task(id).map(|task| task.snapshot())
    }

    /// Snapshots of every task, ordered by id.
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<_> = self
            .read_tasks()
            .values()
            .map(|task| task.snapshot())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        snapshots
    }

    /// Stops accepting submissions and waits until every admitted task,
    /// queued or running, has reached a terminal status.
    pub async fn shutdown(&self) {
        if self.close_admission() {
            info!("download manager draining");
        }

        // Held across the join so a concurrent caller also waits for the drain.
        // The handle is only cleared once joined, so a caller that gives up
        // early (e.g. under a timeout) leaves it for the next one.
        let mut dispatcher = self.dispatcher.lock().await;
        if let Some(handle) = dispatcher.as_mut() {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatcher ended abnormally");
            }
            *dispatcher = None;
            info!("download manager stopped");
        }
    }

    /// Stops accepting submissions, cancels every unfinished task and waits
    /// for their workers to stop. Returns how many tasks were canceled.
    pub async fn shutdown_now(&self) -> usize {
        self.close_admission();

        let unfinished: Vec<_> = self.read_tasks().values().cloned().collect();
        let canceled = unfinished
            .iter()
            .filter(|task| task.cancel().is_ok())
            .count();
        info!(canceled, "download manager stopping");

        self.shutdown().await;
        canceled
    }

    fn close_admission(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    fn task(&self, id: TaskId) -> Option<Arc<DownloadTask>> {
        self.read_tasks().get(&id).cloned()
    }

    fn read_tasks(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TaskId, Arc<DownloadTask>>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tasks(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, Arc<DownloadTask>>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admits queued workers in order, one pool slot each, until the queue is
/// closed and every spawned worker has finished.
async fn dispatch(mut queue: mpsc::UnboundedReceiver<DownloadWorker>, slots: Arc<Semaphore>) {
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(worker) = next else { break };
                let id = worker.task().id();
                let cancellation = worker.task().cancellation_token().clone();

                // A task canceled while queued is handed over without a slot.
                let slot = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => None,
                    // The pool semaphore is never closed.
                    permit = slots.clone().acquire_owned() => permit.ok(),
                };
                debug!(task = %id, slotted = slot.is_some(), "dispatching worker");
                workers.spawn(worker.run(slot));
            }
            Some(joined) = workers.join_next(), if !workers.is_empty() => reap(joined),
        }
    }

    while let Some(joined) = workers.join_next().await {
        reap(joined);
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "download worker ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::FnObserver;

    fn quiet() -> Arc<dyn DownloadObserver> {
        Arc::new(FnObserver::new())
    }

    #[test]
    fn requires_a_runtime() {
        let result = DownloadManager::new(ManagerConfig::default());
        assert!(matches!(result, Err(ManagerError::NoRuntime)));
    }

    #[tokio::test]
    async fn rejects_an_invalid_config() {
        let config = ManagerConfig {
            max_concurrent_downloads: 0,
            ..ManagerConfig::default()
        };
        assert!(matches!(
            DownloadManager::new(config),
            Err(ManagerError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn ids_are_unique_and_sequential() {
        let manager = DownloadManager::new(ManagerConfig {
            tick_interval_ms: 1,
            ..ManagerConfig::default()
        })
        .unwrap();

        let a = manager.submit("http://example.com/file1.zip", quiet()).unwrap();
        let b = manager.submit("http://example.com/file2.zip", quiet()).unwrap();
        assert_ne!(a, b);
        assert_eq!(b.get(), a.get() + 1);

        let snapshots = manager.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].id, a);
        assert_eq!(snapshots[1].url, "http://example.com/file2.zip");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_ids_are_reported_not_found() {
        let manager = DownloadManager::new(ManagerConfig::default()).unwrap();
        assert_eq!(manager.status(TaskId(404)), None);
        assert_eq!(manager.snapshot(TaskId(404)), None);
        assert_eq!(manager.cancel(TaskId(404)), CancelOutcome::NotFound);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn submissions_after_shutdown_are_refused() {
        let manager = DownloadManager::new(ManagerConfig::default()).unwrap();
        manager.shutdown().await;

        assert!(!manager.is_accepting());
        assert!(matches!(
            manager.submit("http://example.com/late.zip", quiet()),
            Err(ManagerError::ShuttingDown)
        ));
        assert!(manager.snapshots().is_empty());
        // A second shutdown is a no-op.
        manager.shutdown().await;
    }
}
