//! Download, track and update tools published in a remote catalog.

pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod index;
pub mod ipc;
pub mod platform;
pub mod progress;
pub mod supervisor;
pub mod types;
pub mod version;

pub use error::{LauncherError, Result};
pub use events::{DownloadEvent, EventKind, Subscription};
pub use index::LocalIndex;
pub use supervisor::DownloadSupervisor;
pub use types::{DownloadId, DownloadJob, DownloadStatus, StartRequest, Tool, ToolStatus};
