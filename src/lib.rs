pub mod config;
pub mod downloader;
pub mod manager;
pub mod models;
pub mod observer;
pub mod task;
pub mod transfer;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{ConfigError, ManagerConfig};
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{CancelOutcome, TaskId, TaskSnapshot, TaskStatus};
    pub use crate::observer::{ChannelObserver, DownloadObserver, FnObserver, TaskEvent};
    pub use crate::transfer::{SimulatedTransfers, Transfer, TransferError, TransferFactory};
}
