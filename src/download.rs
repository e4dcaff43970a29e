//! Transfer engine: moves the bytes of a single download.
//!
//! One [`Transfer`] runs per job as its own task. It is steered through a
//! `watch` channel of [`Control`] values and reports back over an unbounded
//! channel of [`EngineEvent`]s. Pause drops the in-flight response and keeps
//! the partial file; resume reconnects with `Range: bytes=<offset>-`. When the
//! server ignores the range and answers `200`, the partial is discarded and a
//! `Restarted` event tells the caller the byte accounting started over.

use crate::error::LauncherError;
use crate::progress::{ProgressThrottle, SpeedMeter};
use crate::types::{DownloadId, ToolportSettings};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub progress_interval: Duration,
    pub speed_window: Duration,
    pub connect_timeout: Duration,
    /// Abort when no bytes arrive for this long.
    pub stall_timeout: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(100),
            speed_window: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(15),
            stall_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ToolportSettings> for TransferSettings {
    fn from(settings: &ToolportSettings) -> Self {
        Self {
            progress_interval: Duration::from_millis(settings.progress_interval_ms),
            speed_window: Duration::from_millis(settings.speed_window_ms.max(1)),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
            ..Self::default()
        }
    }
}

/// What the supervisor currently wants the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    Progress {
        downloaded: u64,
        total: Option<u64>,
        speed: f64,
    },
    Paused {
        downloaded: u64,
    },
    Resumed {
        downloaded: u64,
    },
    /// The server would not continue from `discarded`; the transfer starts over.
    Restarted {
        discarded: u64,
    },
    Finished {
        downloaded: u64,
        total: Option<u64>,
        partial: PathBuf,
    },
    Failed {
        message: String,
        partial: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub id: DownloadId,
    /// Distinguishes a retried transfer from the one it replaced.
    pub attempt: u32,
    pub kind: EngineEventKind,
}

enum Outcome {
    Finished { downloaded: u64, total: Option<u64> },
    Cancelled,
}

pub struct Transfer {
    pub id: DownloadId,
    pub attempt: u32,
    pub url: String,
    pub partial_path: PathBuf,
    pub client: reqwest::Client,
    pub control: watch::Receiver<Control>,
    pub events: mpsc::UnboundedSender<EngineEvent>,
    pub settings: TransferSettings,
}

/// Parsed `Content-Range` header: `bytes <start>-<end>/<total>` or `bytes */<total>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: Option<u64>,
    pub total: Option<u64>,
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let start = match range.trim() {
        "*" => None,
        r => Some(r.split_once('-')?.0.trim().parse().ok()?),
    };
    Some(ContentRange { start, total })
}

fn content_range(headers: &HeaderMap) -> Option<ContentRange> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
}

/// File name for a downloaded artifact, taken from the last URL path segment.
pub fn filename_from_url(url: &str, fallback: &str) -> String {
    let from_url = reqwest::Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
    });

    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>()
            .trim_matches('.')
            .to_string()
    };

    let mut name = from_url
        .map(|s| sanitize(&s))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| sanitize(fallback));
    if name.is_empty() {
        name = "download".to_string();
    }
    if name.ends_with(".part") {
        name.push_str(".bin");
    }
    name
}

impl Transfer {
    pub async fn run(mut self) {
        tracing::debug!(
            "Transfer {} (attempt {}) starting from {}",
            self.id,
            self.attempt,
            self.url
        );

        match self.drive().await {
            Ok(Outcome::Finished { downloaded, total }) => {
                tracing::debug!("Transfer {} received {} bytes", self.id, downloaded);
                self.emit(EngineEventKind::Finished {
                    downloaded,
                    total,
                    partial: self.partial_path.clone(),
                });
            }
            Ok(Outcome::Cancelled) => {
                tracing::debug!("Transfer {} cancelled", self.id);
                self.discard_partial().await;
            }
            Err(err) => {
                if matches!(err, LauncherError::Storage(_)) {
                    self.discard_partial().await;
                }
                tracing::warn!("Transfer {} failed: {}", self.id, err);
                self.emit(EngineEventKind::Failed {
                    message: err.to_string(),
                    partial: self.partial_path.clone(),
                });
            }
        }
    }

    fn emit(&self, kind: EngineEventKind) {
        // A closed channel means the supervisor is gone; nobody is listening.
        let _ = self.events.send(EngineEvent {
            id: self.id.clone(),
            attempt: self.attempt,
            kind,
        });
    }

    /// Latest requested state; a dropped supervisor handle reads as cancel.
    fn requested(&mut self) -> Control {
        if self.control.has_changed().is_err() {
            return Control::Cancel;
        }
        *self.control.borrow_and_update()
    }

    async fn discard_partial(&self) {
        match tokio::fs::remove_file(&self.partial_path).await {
            Ok(()) => tracing::debug!("Removed partial {}", self.partial_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Could not remove partial {}: {}",
                self.partial_path.display(),
                e
            ),
        }
    }

    /// Blocks while paused. `Some(Cancelled)` when the job should stop.
    async fn hold_if_paused(&mut self, downloaded: u64) -> Option<Outcome> {
        match self.requested() {
            Control::Run => return None,
            Control::Cancel => return Some(Outcome::Cancelled),
            Control::Pause => {}
        }

        tracing::info!("Transfer {} paused at {} bytes", self.id, downloaded);
        self.emit(EngineEventKind::Paused { downloaded });

        loop {
            if self.control.changed().await.is_err() {
                return Some(Outcome::Cancelled);
            }
            match *self.control.borrow_and_update() {
                Control::Run => break,
                Control::Cancel => return Some(Outcome::Cancelled),
                Control::Pause => continue,
            }
        }

        tracing::info!("Transfer {} resuming at {} bytes", self.id, downloaded);
        self.emit(EngineEventKind::Resumed { downloaded });
        None
    }

    async fn drive(&mut self) -> Result<Outcome, LauncherError> {
        if let Some(parent) = self.partial_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut offset = match tokio::fs::metadata(&self.partial_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let mut throttle = ProgressThrottle::new(self.settings.progress_interval);
        let mut meter = SpeedMeter::new(self.settings.speed_window);

        'connect: loop {
            if let Some(outcome) = self.hold_if_paused(offset).await {
                return Ok(outcome);
            }
            meter.reset();
            throttle.reset();

            let mut request = self.client.get(&self.url);
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={}-", offset));
            }

            let response = tokio::select! {
                response = request.send() => response?,
                _ = self.control.changed() => continue 'connect,
            };

            let status = response.status();
            let range = content_range(response.headers());

            let (mut file, total) = if offset > 0 && status == StatusCode::PARTIAL_CONTENT {
                if let Some(start) = range.and_then(|r| r.start) {
                    if start != offset {
                        return Err(LauncherError::Transfer(format!(
                            "server resumed at byte {} instead of {}",
                            start, offset
                        )));
                    }
                }
                let total = range
                    .and_then(|r| r.total)
                    .or_else(|| response.content_length().map(|len| offset + len));
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.partial_path)
                    .await?;
                (file, total)
            } else if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
                if range.and_then(|r| r.total) == Some(offset) {
                    return Ok(Outcome::Finished {
                        downloaded: offset,
                        total: Some(offset),
                    });
                }
                tracing::warn!(
                    "Server rejected resume of {} at {} bytes; starting over",
                    self.id,
                    offset
                );
                self.emit(EngineEventKind::Restarted { discarded: offset });
                File::create(&self.partial_path).await?;
                offset = 0;
                continue 'connect;
            } else if status.is_success() {
                if offset > 0 {
                    tracing::warn!(
                        "Server does not support partial content for {}; discarding {} bytes",
                        self.id,
                        offset
                    );
                    self.emit(EngineEventKind::Restarted { discarded: offset });
                    offset = 0;
                }
                (
                    File::create(&self.partial_path).await?,
                    response.content_length(),
                )
            } else {
                return Err(LauncherError::Transfer(format!(
                    "download failed with status {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("unknown error")
                )));
            };

            let mut stream = response.bytes_stream();
            loop {
                tokio::select! {
                    chunk = tokio::time::timeout(self.settings.stall_timeout, stream.next()) => {
                        match chunk {
                            Ok(Some(Ok(bytes))) => {
                                file.write_all(&bytes).await?;
                                offset += bytes.len() as u64;
                                meter.record(bytes.len() as u64);
                                if throttle.should_emit() {
                                    self.emit(EngineEventKind::Progress {
                                        downloaded: offset,
                                        total,
                                        speed: meter.bytes_per_sec(),
                                    });
                                }
                            }
                            Ok(Some(Err(e))) => {
                                let _ = file.flush().await;
                                return Err(e.into());
                            }
                            Ok(None) => break,
                            Err(_) => {
                                let _ = file.flush().await;
                                return Err(LauncherError::Transfer(format!(
                                    "no data received for {} seconds",
                                    self.settings.stall_timeout.as_secs()
                                )));
                            }
                        }
                    }
                    _ = self.control.changed() => {
                        if self.requested() != Control::Run {
                            file.flush().await?;
                            self.emit(EngineEventKind::Progress {
                                downloaded: offset,
                                total,
                                speed: meter.bytes_per_sec(),
                            });
                            continue 'connect;
                        }
                    }
                }
            }

            file.flush().await?;
            file.sync_all().await?;

            if let Some(expected) = total {
                if offset != expected {
                    return Err(LauncherError::Transfer(format!(
                        "incomplete download: received {} of {} bytes",
                        offset, expected
                    )));
                }
            }

            self.emit(EngineEventKind::Progress {
                downloaded: offset,
                total,
                speed: meter.bytes_per_sec(),
            });
            return Ok(Outcome::Finished {
                downloaded: offset,
                total,
            });
        }
    }
}
