//! JSON-lines bridge for a desktop front end.
//!
//! `toolport serve` reads one request per line on stdin and answers with one
//! response per line on stdout. Download events are interleaved on the same
//! stream as they happen, each line tagged with an `event` field instead of
//! `ok`.

use crate::catalog::{self, CatalogClient, StatusFilter};
use crate::config;
use crate::download::TransferSettings;
use crate::events::{EventKind, Subscription};
use crate::index::LocalIndex;
use crate::platform;
use crate::supervisor::DownloadSupervisor;
use crate::types::{DownloadId, StartRequest, ToolportSettings};
use crate::version;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    StartDownload(StartRequest),
    #[serde(rename_all = "camelCase")]
    PauseDownload { download_id: DownloadId },
    #[serde(rename_all = "camelCase")]
    ResumeDownload { download_id: DownloadId },
    #[serde(rename_all = "camelCase")]
    CancelDownload { download_id: DownloadId },
    GetDownloads,
    GetLocalFiles,
    GetAllToolVersions,
    #[serde(rename_all = "camelCase")]
    GetToolVersionInfo { tool_id: String },
    #[serde(rename_all = "camelCase")]
    CheckFileExists { tool_id: String },
    #[serde(rename_all = "camelCase")]
    DeleteLocalFile { tool_id: String },
    #[serde(rename_all = "camelCase")]
    OpenLocalFile { tool_id: String },
    CompareToolVersions { version1: String, version2: String },
    GetTools,
    CheckUpdate,
    GetDownloadPath,
    SetDownloadPath { path: String },
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    seq: Option<u64>,
    #[serde(flatten)]
    command: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub seq: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn success(seq: Option<u64>, result: Value) -> Self {
        Response {
            seq,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(seq: Option<u64>, error: String) -> Self {
        Response {
            seq,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

struct Active {
    supervisor: DownloadSupervisor,
    forwarder: JoinHandle<()>,
}

pub struct IpcServer {
    active: Mutex<Active>,
    catalog: Arc<CatalogClient>,
    settings: Mutex<ToolportSettings>,
    out: mpsc::UnboundedSender<String>,
    persist_config: bool,
}

fn start_supervisor(settings: &ToolportSettings) -> Result<DownloadSupervisor> {
    let index = LocalIndex::open(&settings.download_dir)?;
    Ok(DownloadSupervisor::new(
        Arc::new(index),
        TransferSettings::from(settings),
    )?)
}

/// Copy supervisor events onto the output stream. A completed download also
/// bumps the remote download counter, best effort.
fn forward_events(
    supervisor: DownloadSupervisor,
    mut events: Subscription,
    catalog: Arc<CatalogClient>,
    out: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let EventKind::Complete { .. } = &event.kind {
                if let Some(job) = supervisor.job(&event.download_id) {
                    let catalog = catalog.clone();
                    tokio::spawn(async move {
                        match catalog.report_download(&job.tool_id).await {
                            Ok(Some(count)) => {
                                tracing::debug!("{} now has {} downloads", job.tool_id, count)
                            }
                            Ok(None) => {}
                            Err(e) => tracing::warn!("Download counter update failed: {}", e),
                        }
                    });
                }
            }
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if out.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Could not encode event: {}", e),
            }
        }
    })
}

impl IpcServer {
    /// Must be called from within a Tokio runtime. With `persist_config`,
    /// `set-download-path` also writes the config file.
    pub fn new(
        settings: ToolportSettings,
        out: mpsc::UnboundedSender<String>,
        persist_config: bool,
    ) -> Result<Self> {
        let catalog = Arc::new(CatalogClient::new(
            &settings.catalog_url,
            &settings.update_url,
            settings.counter_url.as_deref(),
        )?);
        let supervisor = start_supervisor(&settings)?;
        let forwarder = forward_events(
            supervisor.clone(),
            supervisor.subscribe(),
            catalog.clone(),
            out.clone(),
        );
        Ok(Self {
            active: Mutex::new(Active {
                supervisor,
                forwarder,
            }),
            catalog,
            settings: Mutex::new(settings),
            out,
            persist_config,
        })
    }

    pub fn supervisor(&self) -> DownloadSupervisor {
        self.with_supervisor(DownloadSupervisor::clone)
    }

    /// Run `f` against the current supervisor while holding the swap lock, so
    /// `set-download-path` cannot retire it halfway through.
    fn with_supervisor<T>(&self, f: impl FnOnce(&DownloadSupervisor) -> T) -> T {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        f(&active.supervisor)
    }

    /// Parse and execute one request line.
    pub async fn handle_line(&self, line: &str) -> Response {
        let raw: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => return Response::failure(None, format!("malformed request: {}", e)),
        };
        let request: Request = match serde_json::from_value(raw.clone()) {
            Ok(request) => request,
            Err(e) => {
                let seq = raw.get("seq").and_then(Value::as_u64);
                return Response::failure(seq, format!("invalid request: {}", e));
            }
        };
        let seq = request.seq;

        match self.execute(request.command).await {
            Ok(result) => Response::success(seq, result),
            Err(e) => {
                tracing::debug!("Request {:?} failed: {}", seq, e);
                Response::failure(seq, e.to_string())
            }
        }
    }

    pub async fn execute(&self, command: Command) -> Result<Value> {
        let index = self.with_supervisor(|supervisor| supervisor.index().clone());

        let value = match command {
            Command::StartDownload(request) => {
                // Front ends name their own jobs; generated ids show up in get-downloads.
                self.with_supervisor(|supervisor| supervisor.start(request))?;
                json!(true)
            }
            Command::PauseDownload { download_id } => {
                json!(self.with_supervisor(|supervisor| supervisor.pause(&download_id)))
            }
            Command::ResumeDownload { download_id } => {
                json!(self.with_supervisor(|supervisor| supervisor.resume(&download_id)))
            }
            Command::CancelDownload { download_id } => {
                json!(self.with_supervisor(|supervisor| supervisor.cancel(&download_id)))
            }
            Command::GetDownloads => {
                serde_json::to_value(self.with_supervisor(DownloadSupervisor::jobs))?
            }
            Command::GetLocalFiles => serde_json::to_value(index.list()?)?,
            Command::GetAllToolVersions => serde_json::to_value(index.versions()?)?,
            Command::GetToolVersionInfo { tool_id } => {
                let version = index.versions()?.remove(&tool_id);
                serde_json::to_value(version)?
            }
            Command::CheckFileExists { tool_id } => json!(index.exists(&tool_id)?),
            Command::DeleteLocalFile { tool_id } => json!(index.remove(&tool_id)?),
            Command::OpenLocalFile { tool_id } => match index.get(&tool_id)? {
                Some(record) => {
                    platform::open_path(&record.path)?;
                    json!(true)
                }
                None => json!(false),
            },
            Command::CompareToolVersions { version1, version2 } => {
                json!(version::compare_versions(&version1, &version2))
            }
            Command::GetTools => {
                let tools = self.catalog.fetch_tools().await?;
                serde_json::to_value(catalog::tool_views(
                    tools,
                    &index,
                    StatusFilter::All,
                    None,
                )?)?
            }
            Command::CheckUpdate => {
                let check = self.catalog.check_update().await?;
                serde_json::to_value(catalog::evaluate_update(
                    env!("CARGO_PKG_VERSION"),
                    &check,
                ))?
            }
            Command::GetDownloadPath => json!(index.root()),
            Command::SetDownloadPath { path } => {
                self.set_download_path(path)?;
                json!(true)
            }
        };
        Ok(value)
    }

    /// Point downloads at a new directory. Refused while any download is
    /// still downloading or paused.
    fn set_download_path(&self, path: String) -> Result<()> {
        if path.trim().is_empty() {
            return Err(anyhow!("download path must not be empty"));
        }
        let busy = |running: usize| {
            anyhow!(
                "cannot change the download path while {} download(s) are in progress",
                running
            )
        };
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let running = active.supervisor.active_count();
        if running > 0 {
            return Err(busy(running));
        }

        let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = settings.clone();
        updated.download_dir = PathBuf::from(&path).to_string_lossy().to_string();
        let supervisor = start_supervisor(&updated)?;
        // Handles cloned out earlier must not start jobs nobody forwards.
        active.supervisor.close_if_idle().map_err(busy)?;

        if self.persist_config {
            let saved = config::load_config().and_then(|mut stored| {
                stored.settings.download_dir = updated.download_dir.clone();
                config::save_config(&stored)
            });
            if let Err(e) = saved {
                tracing::warn!("Download path changed but not saved: {}", e);
            }
        }

        active.forwarder.abort();
        active.forwarder = forward_events(
            supervisor.clone(),
            supervisor.subscribe(),
            self.catalog.clone(),
            self.out.clone(),
        );
        active.supervisor = supervisor;
        *settings = updated;
        tracing::info!("Download path set to {}", path);
        Ok(())
    }

    /// Stop every download and the event forwarder.
    pub fn shutdown(&self) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let cancelled = active.supervisor.cancel_all();
        if cancelled > 0 {
            tracing::info!("Cancelled {} download(s) on shutdown", cancelled);
        }
        active.forwarder.abort();
    }
}

/// Run the bridge on stdin/stdout until stdin closes.
pub async fn serve(settings: ToolportSettings) -> Result<()> {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let server = Arc::new(IpcServer::new(settings, out_tx.clone(), true)?);
    tracing::info!("Serving requests on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let server = server.clone();
        let out = out_tx.clone();
        // Requests run concurrently; responses are matched by `seq`.
        tokio::spawn(async move {
            let response = server.handle_line(&line).await;
            match serde_json::to_string(&response) {
                Ok(encoded) => {
                    let _ = out.send(encoded);
                }
                Err(e) => tracing::error!("Could not encode response: {}", e),
            }
        });
    }

    tracing::info!("Input closed, shutting down");
    server.shutdown();
    drop(server);
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let request: Request = serde_json::from_str(
            r#"{"seq": 4, "command": "start-download", "downloadId": "d1",
                "url": "http://localhost/a.zip", "toolId": "12",
                "toolName": "Alpha", "toolVersion": "1.0"}"#,
        )
        .unwrap();
        assert_eq!(request.seq, Some(4));
        match request.command {
            Command::StartDownload(start) => {
                assert_eq!(start.download_id, Some(DownloadId::from("d1")));
                assert_eq!(start.tool_id, "12");
                assert_eq!(start.tool_version, "1.0");
            }
            other => panic!("unexpected command {:?}", other),
        }

        let request: Request =
            serde_json::from_str(r#"{"command": "pause-download", "downloadId": "d1"}"#).unwrap();
        assert_eq!(request.seq, None);
        assert_eq!(
            request.command,
            Command::PauseDownload {
                download_id: DownloadId::from("d1")
            }
        );

        let request: Request = serde_json::from_str(
            r#"{"command": "compare-tool-versions", "version1": "1.2.0", "version2": "1.2"}"#,
        )
        .unwrap();
        assert!(matches!(request.command, Command::CompareToolVersions { .. }));

        assert!(serde_json::from_str::<Request>(r#"{"command": "reboot"}"#).is_err());
    }

    fn settings_in(dir: &std::path::Path) -> ToolportSettings {
        ToolportSettings {
            download_dir: dir.join("downloads").to_string_lossy().to_string(),
            catalog_url: "http://127.0.0.1:9/tools".to_string(),
            update_url: "http://127.0.0.1:9/update".to_string(),
            counter_url: None,
            ..ToolportSettings::default()
        }
    }

    #[tokio::test]
    async fn test_local_queries() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = IpcServer::new(settings_in(dir.path()), tx, false).unwrap();

        let response = server
            .handle_line(r#"{"seq": 1, "command": "compare-tool-versions", "version1": "1.2.0", "version2": "1.2"}"#)
            .await;
        assert!(response.ok);
        assert_eq!(response.seq, Some(1));
        assert_eq!(response.result, Some(json!(0)));

        let response = server
            .handle_line(r#"{"seq": 2, "command": "check-file-exists", "toolId": "7"}"#)
            .await;
        assert_eq!(response.result, Some(json!(false)));

        let response = server
            .handle_line(r#"{"seq": 3, "command": "get-tool-version-info", "toolId": "7"}"#)
            .await;
        assert_eq!(response.result, Some(Value::Null));

        let response = server
            .handle_line(r#"{"seq": 4, "command": "cancel-download", "downloadId": "nope"}"#)
            .await;
        assert_eq!(response.result, Some(json!(false)));
    }

    #[tokio::test]
    async fn test_errors_carry_seq() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = IpcServer::new(settings_in(dir.path()), tx, false).unwrap();

        let response = server
            .handle_line(r#"{"seq": 9, "command": "start-download", "toolId": "7", "toolVersion": "1.0"}"#)
            .await;
        assert!(!response.ok);
        assert_eq!(response.seq, Some(9));
        assert!(response.error.unwrap().contains("no download URL"));

        let response = server.handle_line("not json").await;
        assert!(!response.ok);
        assert_eq!(response.seq, None);
    }

    #[tokio::test]
    async fn test_set_download_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = IpcServer::new(settings_in(dir.path()), tx, false).unwrap();

        let target = dir.path().join("elsewhere");
        let line = json!({ "seq": 1, "command": "set-download-path", "path": target }).to_string();
        assert_eq!(server.handle_line(&line).await.result, Some(json!(true)));

        let response = server
            .handle_line(r#"{"seq": 2, "command": "get-download-path"}"#)
            .await;
        assert_eq!(response.result, Some(json!(target)));
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn test_set_download_path_retires_old_supervisor() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = IpcServer::new(settings_in(dir.path()), tx, false).unwrap();
        let old = server.supervisor();

        let target = dir.path().join("elsewhere");
        let line = json!({ "seq": 1, "command": "set-download-path", "path": target }).to_string();
        assert_eq!(server.handle_line(&line).await.result, Some(json!(true)));
        assert!(old.is_closed());
        assert!(!server.supervisor().is_closed());

        let request = StartRequest {
            download_id: Some(DownloadId::from("late")),
            url: Some("http://127.0.0.1:9/tool.zip".to_string()),
            tool_id: "7".to_string(),
            tool_name: "Late".to_string(),
            tool_version: "1.0".to_string(),
        };
        assert_eq!(old.start(request), Err(crate::LauncherError::Closed));
        assert!(old.jobs().is_empty());
        assert!(server.supervisor().jobs().is_empty());
    }
}
