//! Download supervisor.
//!
//! Owns every tracked download, routes control signals to the matching
//! transfer engine and republishes engine output as [`DownloadEvent`]s.
//!
//! # Concurrency model
//!
//! - One Tokio task per transfer, plus a single dispatcher task that consumes
//!   all engine output in order, so events for a given job keep their order.
//! - The job table is behind one `std::sync::Mutex`; critical sections never
//!   await. `start`, `cancel` and terminal-event handling all take this lock,
//!   so two live engines for the same tool can never coexist.
//! - `cancel` removes the job and signals the engine under the lock; the
//!   dispatcher drops anything it receives for a job that is no longer in the
//!   table, which is how late events after a cancel are suppressed.
//! - A completed download is moved into place and recorded in the
//!   [`LocalIndex`] before `download-complete` is published. The move and the
//!   manifest write run under the job-table lock, so `pause`, `resume` and
//!   `cancel` may block for the duration of one rename plus one small file
//!   write.
//! - [`close_if_idle`](DownloadSupervisor::close_if_idle) checks for active
//!   jobs and stops accepting new ones in the same critical section.

use crate::download::{
    filename_from_url, Control, EngineEvent, EngineEventKind, Transfer, TransferSettings,
};
use crate::error::{LauncherError, Result};
use crate::events::{DownloadEvent, EventHub, EventKind, Subscription};
use crate::index::{validate_component, validate_tool_id, LocalIndex};
use crate::types::{DownloadId, DownloadJob, DownloadStatus, StartRequest};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};

struct JobEntry {
    job: DownloadJob,
    /// Insertion order, for stable listings.
    seq: u64,
    attempt: u32,
    control: watch::Sender<Control>,
    partial_path: PathBuf,
    filename: String,
}

impl JobEntry {
    fn requested(&self) -> Control {
        *self.control.borrow()
    }
}

#[derive(Default)]
struct State {
    jobs: HashMap<DownloadId, JobEntry>,
    next_seq: u64,
    closed: bool,
}

impl State {
    fn active_for_tool(&self, tool_id: &str) -> Option<&DownloadId> {
        self.jobs
            .iter()
            .find(|(_, entry)| entry.job.tool_id == tool_id && entry.job.status.is_active())
            .map(|(id, _)| id)
    }
}

struct Shared {
    state: Mutex<State>,
    index: Arc<LocalIndex>,
    hub: EventHub,
    client: reqwest::Client,
    settings: TransferSettings,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
}

/// Handle to the download supervisor. Cheap to clone; all clones share state.
///
/// Dropping the last handle cancels every running transfer.
#[derive(Clone)]
pub struct DownloadSupervisor {
    shared: Arc<Shared>,
}

fn percent(downloaded: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => (downloaded as f64 / total as f64 * 100.0).min(100.0),
        _ => 0.0,
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed leftover partial {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Could not remove {}: {}", path.display(), e),
    }
}

impl DownloadSupervisor {
    /// Create a supervisor. Must be called from within a Tokio runtime.
    pub fn new(index: Arc<LocalIndex>, settings: TransferSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .user_agent(concat!("toolport/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            index,
            hub: EventHub::new(),
            client,
            settings,
            engine_tx,
        });

        tokio::spawn(dispatch(Arc::downgrade(&shared), engine_rx));
        Ok(Self { shared })
    }

    pub fn index(&self) -> &Arc<LocalIndex> {
        &self.shared.index
    }

    /// Events for every download.
    pub fn subscribe(&self) -> Subscription {
        self.shared.hub.subscribe(None)
    }

    /// Events for one download only. The id does not need to exist yet, so a
    /// caller choosing its own id can subscribe before calling [`start`](Self::start).
    pub fn subscribe_job(&self, id: &DownloadId) -> Subscription {
        self.shared.hub.subscribe(Some(id.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin a download and return its id without waiting for it.
    pub fn start(&self, request: StartRequest) -> Result<DownloadId> {
        let url = request
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                LauncherError::InvalidInput(format!("no download URL for tool {}", request.tool_id))
            })?
            .to_string();
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| LauncherError::InvalidInput(format!("invalid URL '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(LauncherError::InvalidInput(format!(
                "unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }
        validate_tool_id(&request.tool_id)?;
        if request.tool_version.trim().is_empty() {
            return Err(LauncherError::InvalidInput(format!(
                "no version declared for tool {}",
                request.tool_id
            )));
        }

        let filename = filename_from_url(&url, &request.tool_name);
        let mut state = self.lock();
        if state.closed {
            return Err(LauncherError::Closed);
        }

        if let Some(existing) = state.active_for_tool(&request.tool_id) {
            return Err(LauncherError::Conflict {
                tool_id: request.tool_id.clone(),
                download_id: existing.to_string(),
            });
        }

        let id = match request.download_id {
            Some(id) => {
                validate_component("download id", id.as_str())?;
                if state.jobs.contains_key(&id) {
                    return Err(LauncherError::InvalidInput(format!(
                        "download id {} is already in use",
                        id
                    )));
                }
                id
            }
            None => DownloadId::generate(),
        };

        let partial_path = self
            .shared
            .index
            .partial_path(&request.tool_id, &filename, id.as_str())?;
        let (control, control_rx) = watch::channel(Control::Run);

        let job = DownloadJob {
            id: id.clone(),
            tool_id: request.tool_id.clone(),
            tool_name: request.tool_name.clone(),
            tool_version: request.tool_version.clone(),
            url: url.clone(),
            status: DownloadStatus::Downloading,
            progress: 0.0,
            downloaded: 0,
            total: None,
            speed: 0.0,
            error: None,
            filename: None,
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            id.clone(),
            JobEntry {
                job,
                seq,
                attempt: 0,
                control,
                partial_path: partial_path.clone(),
                filename,
            },
        );

        self.spawn_transfer(id.clone(), 0, url, partial_path, control_rx);
        tracing::info!(
            "Started download {} for {} v{}",
            id,
            request.tool_id,
            request.tool_version
        );
        Ok(id)
    }

    fn spawn_transfer(
        &self,
        id: DownloadId,
        attempt: u32,
        url: String,
        partial_path: PathBuf,
        control: watch::Receiver<Control>,
    ) {
        let transfer = Transfer {
            id,
            attempt,
            url,
            partial_path,
            client: self.shared.client.clone(),
            control,
            events: self.shared.engine_tx.clone(),
            settings: self.shared.settings.clone(),
        };
        tokio::spawn(transfer.run());
    }

    /// Ask a running download to pause. `false` for unknown ids or jobs that
    /// are not downloading.
    pub fn pause(&self, id: &DownloadId) -> bool {
        let state = self.lock();
        let Some(entry) = state.jobs.get(id) else {
            tracing::debug!("pause: unknown download {}", id);
            return false;
        };
        if entry.job.status != DownloadStatus::Downloading || entry.requested() != Control::Run {
            return false;
        }
        entry.control.send_replace(Control::Pause);
        tracing::debug!("Pause requested for {}", id);
        true
    }

    /// Resume a paused download, or retry one that ended in error from the
    /// bytes already on disk.
    pub fn resume(&self, id: &DownloadId) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.jobs.get(id) else {
            tracing::debug!("resume: unknown download {}", id);
            return false;
        };

        let status = entry.job.status;
        match status {
            DownloadStatus::Downloading | DownloadStatus::Paused => {
                if entry.requested() != Control::Pause {
                    return false;
                }
                entry.control.send_replace(Control::Run);
                tracing::debug!("Resume requested for {}", id);
                true
            }
            DownloadStatus::Error => {
                if state.closed {
                    tracing::debug!("Not retrying {}: supervisor is closed", id);
                    return false;
                }
                let tool_id = entry.job.tool_id.clone();
                if let Some(other) = state.active_for_tool(&tool_id) {
                    tracing::warn!(
                        "Not retrying {}: {} already has active download {}",
                        id,
                        tool_id,
                        other
                    );
                    return false;
                }

                let Some(entry) = state.jobs.get_mut(id) else {
                    return false;
                };
                let (control, control_rx) = watch::channel(Control::Run);
                entry.attempt += 1;
                entry.control = control;
                entry.job.status = DownloadStatus::Downloading;
                entry.job.error = None;
                entry.job.speed = 0.0;

                let attempt = entry.attempt;
                let url = entry.job.url.clone();
                let partial_path = entry.partial_path.clone();
                drop(state);

                tracing::info!("Retrying download {} (attempt {})", id, attempt);
                self.spawn_transfer(id.clone(), attempt, url, partial_path, control_rx);
                true
            }
            DownloadStatus::Completed => false,
        }
    }

    /// Stop tracking a download. Once this returns no further progress or
    /// completion events are published for `id`.
    pub fn cancel(&self, id: &DownloadId) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.jobs.remove(id) else {
            tracing::debug!("cancel: unknown download {}", id);
            return false;
        };
        entry.control.send_replace(Control::Cancel);
        if entry.job.status == DownloadStatus::Error {
            // The engine has already exited; nobody else owns this file.
            remove_quietly(&entry.partial_path);
        }
        tracing::info!("Cancelled download {}", id);
        true
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<DownloadId> = self.lock().jobs.keys().cloned().collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn job(&self, id: &DownloadId) -> Option<DownloadJob> {
        self.lock().jobs.get(id).map(|entry| entry.job.clone())
    }

    pub fn jobs(&self) -> Vec<DownloadJob> {
        let state = self.lock();
        let mut entries: Vec<&JobEntry> = state.jobs.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.job.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        Self::count_active(&self.lock())
    }

    fn count_active(state: &State) -> usize {
        state
            .jobs
            .values()
            .filter(|entry| entry.job.status.is_active())
            .count()
    }

    /// Stop accepting downloads if none is downloading or paused. On refusal
    /// returns the number of active jobs. Closing twice is fine.
    pub fn close_if_idle(&self) -> std::result::Result<(), usize> {
        let mut state = self.lock();
        let active = Self::count_active(&state);
        if active > 0 {
            return Err(active);
        }
        state.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Forget completed and failed downloads. Returns how many were dropped.
    pub fn clear_finished(&self) -> usize {
        let mut state = self.lock();
        let finished: Vec<DownloadId> = state
            .jobs
            .iter()
            .filter(|(_, entry)| !entry.job.status.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &finished {
            if let Some(entry) = state.jobs.remove(id) {
                if entry.job.status == DownloadStatus::Error {
                    remove_quietly(&entry.partial_path);
                }
            }
        }
        finished.len()
    }
}

async fn dispatch(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        match shared.upgrade() {
            Some(shared) => shared.handle(event),
            None => discard_orphan(&event),
        }
    }
    tracing::debug!("Download dispatcher stopped");
}

/// Clean up after a terminal event nobody is waiting for any more.
fn discard_orphan(event: &EngineEvent) {
    match &event.kind {
        EngineEventKind::Finished { partial, .. } | EngineEventKind::Failed { partial, .. } => {
            remove_quietly(partial)
        }
        _ => {}
    }
}

impl Shared {
    fn handle(&self, event: EngineEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let Some(entry) = state.jobs.get_mut(&event.id) else {
            tracing::trace!("Dropping event for untracked download {}", event.id);
            discard_orphan(&event);
            return;
        };
        if entry.attempt != event.attempt || !entry.job.status.is_active() {
            tracing::trace!("Dropping stale event for {}", event.id);
            return;
        }

        let id = event.id;
        let job = &mut entry.job;
        let kind = match event.kind {
            EngineEventKind::Progress {
                downloaded,
                total,
                speed,
            } => {
                job.downloaded = downloaded;
                job.total = total;
                job.speed = speed;
                job.progress = percent(downloaded, total);
                EventKind::Progress {
                    progress: job.progress,
                    speed,
                    downloaded,
                    total,
                }
            }
            EngineEventKind::Paused { downloaded } => {
                job.status = DownloadStatus::Paused;
                job.downloaded = downloaded;
                job.speed = 0.0;
                EventKind::Paused { downloaded }
            }
            EngineEventKind::Resumed { downloaded } => {
                job.status = DownloadStatus::Downloading;
                EventKind::Resumed { downloaded }
            }
            EngineEventKind::Restarted { discarded } => {
                job.downloaded = 0;
                job.progress = 0.0;
                job.total = None;
                EventKind::Restarted { discarded }
            }
            EngineEventKind::Finished {
                downloaded,
                total,
                partial,
            } => {
                job.speed = 0.0;
                match self.index.install_artifact(
                    &job.tool_id,
                    &job.tool_name,
                    &job.tool_version,
                    &partial,
                    &entry.filename,
                ) {
                    Ok(path) => {
                        job.status = DownloadStatus::Completed;
                        job.downloaded = downloaded;
                        job.total = total.or(Some(downloaded));
                        job.progress = 100.0;
                        job.filename = Some(entry.filename.clone());
                        tracing::info!("Download {} complete: {}", id, path.display());
                        EventKind::Complete {
                            filename: entry.filename.clone(),
                            path,
                        }
                    }
                    Err(err) => {
                        remove_quietly(&partial);
                        job.status = DownloadStatus::Error;
                        job.error = Some(err.to_string());
                        tracing::error!("Could not install download {}: {}", id, err);
                        EventKind::Error {
                            error: err.to_string(),
                        }
                    }
                }
            }
            EngineEventKind::Failed { message, .. } => {
                job.status = DownloadStatus::Error;
                job.speed = 0.0;
                job.error = Some(message.clone());
                EventKind::Error { error: message }
            }
        };

        // Published under the lock so a concurrent cancel cannot slip in between.
        self.hub.publish(DownloadEvent {
            download_id: id,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(50, Some(200)), 25.0);
        assert_eq!(percent(10, None), 0.0);
        assert_eq!(percent(10, Some(0)), 0.0);
        assert_eq!(percent(300, Some(200)), 100.0);
    }
}
