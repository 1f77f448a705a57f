// src/observer.rs

use crate::models::TaskId;
use tokio::sync::mpsc;

/// Message used when a cancellation is reported through `on_error`.
pub const CANCELED_MESSAGE: &str = "download canceled";

/// Receives the events of the tasks it is registered on.
///
/// Callbacks run synchronously on whichever thread drives the task's worker.
/// Calls for one task never overlap and arrive in order; calls for different
/// tasks may run concurrently. Exactly one of `on_complete`, `on_error` or
/// `on_cancel` is delivered per task, after all of its `on_progress` calls.
///
/// A panicking callback is caught and logged and does not stop delivery to
/// the other observers. A callback that blocks stalls the task's worker.
pub trait DownloadObserver: Send + Sync {
    fn on_progress(&self, id: TaskId, percent: u8);

    fn on_complete(&self, id: TaskId);

    fn on_error(&self, id: TaskId, message: &str);

    /// Defaults to reporting the cancellation as an error.
    fn on_cancel(&self, id: TaskId) {
        self.on_error(id, CANCELED_MESSAGE);
    }
}

/// One observable change of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Progress(u8),
    Completed,
    Failed(String),
    Canceled,
}

impl TaskEvent {
    /// Whether this is the last event a task will ever emit.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }

    pub(crate) fn deliver(&self, id: TaskId, observer: &dyn DownloadObserver) {
        match self {
            Self::Progress(percent) => observer.on_progress(id, *percent),
            Self::Completed => observer.on_complete(id),
            Self::Failed(message) => observer.on_error(id, message),
            Self::Canceled => observer.on_cancel(id),
        }
    }
}

type ProgressFn = Box<dyn Fn(TaskId, u8) + Send + Sync>;
type CompleteFn = Box<dyn Fn(TaskId) + Send + Sync>;
type ErrorFn = Box<dyn Fn(TaskId, &str) + Send + Sync>;

/// An observer assembled from closures. Slots left empty ignore their event.
#[derive(Default)]
pub struct FnObserver {
    progress: Option<ProgressFn>,
    complete: Option<CompleteFn>,
    error: Option<ErrorFn>,
    cancel: Option<CompleteFn>,
}

impl FnObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, f: impl Fn(TaskId, u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn with_complete(mut self, f: impl Fn(TaskId) + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(TaskId, &str) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    /// Without a cancel slot, cancellations go to the error slot.
    pub fn with_cancel(mut self, f: impl Fn(TaskId) + Send + Sync + 'static) -> Self {
        self.cancel = Some(Box::new(f));
        self
    }
}

impl DownloadObserver for FnObserver {
    fn on_progress(&self, id: TaskId, percent: u8) {
        if let Some(f) = &self.progress {
            f(id, percent);
        }
    }

    fn on_complete(&self, id: TaskId) {
        if let Some(f) = &self.complete {
            f(id);
        }
    }

    fn on_error(&self, id: TaskId, message: &str) {
        if let Some(f) = &self.error {
            f(id, message);
        }
    }

    fn on_cancel(&self, id: TaskId) {
        match &self.cancel {
            Some(f) => f(id),
            None => self.on_error(id, CANCELED_MESSAGE),
        }
    }
}

/// Forwards every event into a channel, for consumers living on another task.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<(TaskId, TaskEvent)>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(TaskId, TaskEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, id: TaskId, event: TaskEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send((id, event));
    }
}

impl DownloadObserver for ChannelObserver {
    fn on_progress(&self, id: TaskId, percent: u8) {
        self.forward(id, TaskEvent::Progress(percent));
    }

    fn on_complete(&self, id: TaskId) {
        self.forward(id, TaskEvent::Completed);
    }

    fn on_error(&self, id: TaskId, message: &str) {
        self.forward(id, TaskEvent::Failed(message.to_string()));
    }

    fn on_cancel(&self, id: TaskId) {
        self.forward(id, TaskEvent::Canceled);
    }
}
