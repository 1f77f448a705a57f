// src/downloader.rs

use crate::models::TaskStatus;
use crate::task::{panic_message, DownloadTask};
use crate::transfer::{Transfer, TransferError};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info};

/// Reasons a worker stops driving its task.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("download stopped")]
    Stopped,
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Drives one task from `Pending` to a terminal status.
///
/// The worker is the only emitter of its task's events: progress while it
/// runs, then exactly one completion, failure or cancellation.
pub struct DownloadWorker {
    task: Arc<DownloadTask>,
    transfer: Box<dyn Transfer>,
    interval: Duration,
}

impl DownloadWorker {
    pub fn new(task: Arc<DownloadTask>, transfer: Box<dyn Transfer>, interval: Duration) -> Self {
        Self {
            task,
            transfer,
            interval,
        }
    }

    pub fn task(&self) -> &Arc<DownloadTask> {
        &self.task
    }

    /// Runs the task to its end. `_slot` is held for the whole run and
    /// released on return; it is `None` only for tasks canceled while queued.
    pub async fn run(mut self, _slot: Option<OwnedSemaphorePermit>) {
        let id = self.task.id();

        if !self.task.start() {
            debug!(task = %id, status = %self.task.status(), "task left the queue before starting");
            self.finish_stopped();
            return;
        }
        info!(task = %id, url = self.task.url(), "worker started");

        let result = match AssertUnwindSafe(self.transfer_loop()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(DownloadError::Panicked(
                panic_message(payload.as_ref()).to_string(),
            )),
        };

        match result {
            Ok(()) => {
                if !self.task.complete() {
                    self.finish_stopped();
                }
            }
            Err(DownloadError::Stopped) => self.finish_stopped(),
            Err(e) => {
                if !self.task.fail(&e.to_string()) {
                    self.finish_stopped();
                }
            }
        }
    }

    async fn transfer_loop(&mut self) -> Result<(), DownloadError> {
        let cancellation = self.task.cancellation_token().clone();
        loop {
            let (status, progress) = {
                let snapshot = self.task.snapshot();
                (snapshot.status, snapshot.progress)
            };
            if status != TaskStatus::InProgress {
                return Err(DownloadError::Stopped);
            }
            if progress >= 100 {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancellation.cancelled() => return Err(DownloadError::Stopped),
            }

            let step = self.transfer.advance()?;
            let next = progress.saturating_add(step).min(100);
            // A step that covered nothing is not a state change.
            if next == progress {
                continue;
            }
            if !self.task.set_progress(next) {
                return Err(DownloadError::Stopped);
            }
        }
    }

    /// The task reached a terminal status that this worker did not set.
    fn finish_stopped(&self) {
        match self.task.status() {
            TaskStatus::Canceled => {
                info!(
                    task = %self.task.id(),
                    progress = self.task.progress(),
                    "worker stopped after cancellation"
                );
                self.task.report_canceled();
            }
            status => debug!(task = %self.task.id(), %status, "worker stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskId;
    use crate::observer::{ChannelObserver, FnObserver, TaskEvent};
    use std::collections::VecDeque;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Scripted(VecDeque<Result<u8, TransferError>>);

    impl Transfer for Scripted {
        fn advance(&mut self) -> Result<u8, TransferError> {
            self.0.pop_front().unwrap_or(Ok(1))
        }
    }

    struct Exploding;

    impl Transfer for Exploding {
        fn advance(&mut self) -> Result<u8, TransferError> {
            panic!("transfer exploded")
        }
    }

    fn worker_for(
        transfer: impl Transfer + 'static,
        interval: Duration,
    ) -> (DownloadWorker, UnboundedReceiver<(TaskId, TaskEvent)>) {
        let task = Arc::new(DownloadTask::new(TaskId(1), "http://example.com/file1.zip"));
        let (observer, rx) = ChannelObserver::new();
        task.register_observer(Arc::new(observer));
        (DownloadWorker::new(task, Box::new(transfer), interval), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<(TaskId, TaskEvent)>) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Ok((_, event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn progress_saturates_then_completes() {
        let steps = VecDeque::from([Ok(30), Ok(30), Ok(30), Ok(30)]);
        let (worker, mut rx) = worker_for(Scripted(steps), Duration::from_millis(1));
        let task = worker.task().clone();

        worker.run(None).await;

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.progress(), 100);
        assert_eq!(
            drain(&mut rx),
            vec![
                TaskEvent::Progress(30),
                TaskEvent::Progress(60),
                TaskEvent::Progress(90),
                TaskEvent::Progress(100),
                TaskEvent::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn empty_steps_emit_nothing() {
        let steps = VecDeque::from([Ok(0), Ok(50), Ok(0), Ok(0), Ok(50)]);
        let (worker, mut rx) = worker_for(Scripted(steps), Duration::from_millis(1));
        let task = worker.task().clone();

        worker.run(None).await;

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(
            drain(&mut rx),
            vec![
                TaskEvent::Progress(50),
                TaskEvent::Progress(100),
                TaskEvent::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn cancel_at_full_progress_wins_over_completion() {
        let steps = VecDeque::from([Ok(50), Ok(50)]);
        let (worker, mut rx) = worker_for(Scripted(steps), Duration::from_millis(1));
        let task = worker.task().clone();

        // Cancels between the last progress step and the completion.
        let target = Arc::downgrade(&task);
        task.register_observer(Arc::new(FnObserver::new().with_progress(move |_, percent| {
            if percent == 100 {
                if let Some(task) = target.upgrade() {
                    task.cancel().unwrap();
                }
            }
        })));

        worker.run(None).await;

        assert_eq!(task.status(), TaskStatus::Canceled);
        assert_eq!(task.progress(), 100);
        assert_eq!(
            drain(&mut rx),
            vec![
                TaskEvent::Progress(50),
                TaskEvent::Progress(100),
                TaskEvent::Canceled,
            ]
        );
    }

    #[tokio::test]
    async fn transfer_error_fails_the_task() {
        let steps = VecDeque::from([
            Ok(10),
            Err(TransferError::Interrupted("reset by peer".into())),
        ]);
        let (worker, mut rx) = worker_for(Scripted(steps), Duration::from_millis(1));
        let task = worker.task().clone();

        worker.run(None).await;

        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.progress(), 10);
        assert_eq!(
            drain(&mut rx),
            vec![
                TaskEvent::Progress(10),
                TaskEvent::Failed("transfer interrupted: reset by peer".into()),
            ]
        );
    }

    #[tokio::test]
    async fn panicking_transfer_is_contained() {
        let (worker, mut rx) = worker_for(Exploding, Duration::from_millis(1));
        let task = worker.task().clone();

        worker.run(None).await;

        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(
            drain(&mut rx),
            vec![TaskEvent::Failed("worker panicked: transfer exploded".into())]
        );
    }

    #[tokio::test]
    async fn canceled_before_start_reports_once_and_never_progresses() {
        let (worker, mut rx) = worker_for(Scripted(VecDeque::new()), Duration::from_millis(1));
        let task = worker.task().clone();
        task.cancel().unwrap();

        worker.run(None).await;

        assert_eq!(task.status(), TaskStatus::Canceled);
        assert_eq!(task.progress(), 0);
        assert_eq!(drain(&mut rx), vec![TaskEvent::Canceled]);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_sleep() {
        let (worker, mut rx) = worker_for(Scripted(VecDeque::new()), Duration::from_secs(3600));
        let task = worker.task().clone();
        let handle = tokio::spawn(worker.run(None));

        while task.status() == TaskStatus::Pending {
            tokio::task::yield_now().await;
        }
        task.cancel().unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop promptly")
            .unwrap();

        assert_eq!(task.status(), TaskStatus::Canceled);
        assert_eq!(drain(&mut rx), vec![TaskEvent::Canceled]);
    }
}
