// src/task.rs

use crate::models::{TaskId, TaskSnapshot, TaskStatus};
use crate::observer::{DownloadObserver, TaskEvent};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status and progress live in one cell so that every read is a consistent
/// pair and every status change is a single compare-and-set.
fn pack(status: TaskStatus, progress: u8) -> u16 {
    (u16::from(status.to_u8()) << 8) | u16::from(progress)
}

fn unpack(state: u16) -> (TaskStatus, u8) {
    (TaskStatus::from_u8((state >> 8) as u8), state as u8)
}

/// A single tracked download.
///
/// Progress is written only by the worker that owns the task. Status is also
/// written by the cancellation path, which never touches progress. Events are
/// emitted only by the owning worker, so each task's event stream is totally
/// ordered.
pub struct DownloadTask {
    id: TaskId,
    url: String,
    state: AtomicU16,
    observers: Mutex<Vec<Arc<dyn DownloadObserver>>>,
    cancellation: CancellationToken,
}

impl DownloadTask {
    pub fn new(id: TaskId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            state: AtomicU16::new(pack(TaskStatus::Pending, 0)),
            observers: Mutex::new(Vec::new()),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> TaskStatus {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    pub fn progress(&self) -> u8 {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let (status, progress) = unpack(self.state.load(Ordering::Acquire));
        TaskSnapshot {
            id: self.id,
            url: self.url.clone(),
            status,
            progress,
        }
    }

    /// Appends an observer. Observers are notified in registration order.
    pub fn register_observer(&self, observer: Arc<dyn DownloadObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Fired when the task is canceled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Applies `f` to the current state until the compare-and-set lands or
    /// `f` refuses the transition. Returns the state that was replaced.
    fn update(
        &self,
        mut f: impl FnMut(TaskStatus, u8) -> Option<u16>,
    ) -> Result<(TaskStatus, u8), (TaskStatus, u8)> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (status, progress) = unpack(current);
            let Some(next) = f(status, progress) else {
                return Err((status, progress));
            };
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok((status, progress)),
                Err(actual) => current = actual,
            }
        }
    }

    /// PENDING -> IN_PROGRESS. Emits nothing.
    pub fn start(&self) -> bool {
        self.update(|status, progress| {
            (status == TaskStatus::Pending).then(|| pack(TaskStatus::InProgress, progress))
        })
        .is_ok()
    }

    /// Records new progress and notifies observers.
    ///
    /// Only succeeds while the task is in progress; the caller keeps
    /// `percent` within `0..=100`.
    pub fn set_progress(&self, percent: u8) -> bool {
        debug_assert!(percent <= 100, "progress out of range: {percent}");
        let applied = self
            .update(|status, _| (status == TaskStatus::InProgress).then(|| pack(status, percent)))
            .is_ok();
        if applied {
            debug!(task = %self.id, percent, "progress");
            self.notify(&TaskEvent::Progress(percent));
        }
        applied
    }

    /// IN_PROGRESS -> COMPLETED, allowed once progress has saturated.
    pub fn complete(&self) -> bool {
        let applied = self
            .update(|status, progress| {
                (status == TaskStatus::InProgress && progress >= 100)
                    .then(|| pack(TaskStatus::Completed, progress))
            })
            .is_ok();
        if applied {
            info!(task = %self.id, "download completed");
            self.notify(&TaskEvent::Completed);
        }
        applied
    }

    /// IN_PROGRESS -> FAILED, delivering `message` to observers.
    pub fn fail(&self, message: &str) -> bool {
        let applied = self
            .update(|status, progress| {
                (status == TaskStatus::InProgress).then(|| pack(TaskStatus::Failed, progress))
            })
            .is_ok();
        if applied {
            warn!(task = %self.id, error = message, "download failed");
            self.notify(&TaskEvent::Failed(message.to_string()));
        }
        applied
    }

    /// PENDING/IN_PROGRESS -> CANCELED.
    ///
    /// Only flips the status and fires the cancellation token; the owning
    /// worker reports the cancellation once it notices. On refusal the
    /// current (terminal) status is returned.
    pub fn cancel(&self) -> Result<(), TaskStatus> {
        self.update(|status, progress| {
            status
                .is_cancelable()
                .then(|| pack(TaskStatus::Canceled, progress))
        })
        .map_err(|(status, _)| status)?;
        self.cancellation.cancel();
        info!(task = %self.id, "cancellation requested");
        Ok(())
    }

    /// Delivers the cancellation event. Called by the owning worker once.
    pub(crate) fn report_canceled(&self) {
        debug_assert_eq!(self.status(), TaskStatus::Canceled);
        self.notify(&TaskEvent::Canceled);
    }

    fn notify(&self, event: &TaskEvent) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                event.deliver(self.id, observer.as_ref())
            }));
            if let Err(payload) = delivered {
                warn!(
                    task = %self.id,
                    panic = panic_message(payload.as_ref()),
                    "observer panicked; skipping it for this event"
                );
            }
        }
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (status, progress) = unpack(self.state.load(Ordering::Acquire));
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("status", &status)
            .field("progress", &progress)
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
