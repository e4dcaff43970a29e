use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Deterministic payload so corrupted resumes show up as content mismatches.
#[allow(dead_code)]
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[allow(dead_code)]
#[derive(Clone)]
pub struct ServerOptions {
    /// Honor `Range` requests with `206 Partial Content`.
    pub ranges: bool,
    pub chunk_size: usize,
    /// Delay before every chunk of a response body.
    pub chunk_delay: Duration,
    /// Answer this many requests for a file with `503` before serving it.
    pub fail_first: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ranges: true,
            chunk_size: 4096,
            chunk_delay: Duration::from_millis(20),
            fail_first: 0,
        }
    }
}

#[derive(Clone)]
struct ServerState {
    options: ServerOptions,
    files: Arc<HashMap<String, Vec<u8>>>,
    requests: Arc<Mutex<Vec<(String, Option<u64>)>>>,
    failures: Arc<AtomicUsize>,
    counter: Arc<AtomicU64>,
    catalog: Arc<Value>,
}

/// Local HTTP server standing in for the catalog and file hosts.
#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    state: ServerState,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start(options: ServerOptions, files: Vec<(&str, Vec<u8>)>) -> Self {
        Self::with_catalog(options, files, json!([])).await
    }

    pub async fn with_catalog(
        options: ServerOptions,
        files: Vec<(&str, Vec<u8>)>,
        tools: Value,
    ) -> Self {
        let state = ServerState {
            options,
            files: Arc::new(
                files
                    .into_iter()
                    .map(|(name, data)| (name.to_string(), data))
                    .collect(),
            ),
            requests: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(AtomicUsize::new(0)),
            counter: Arc::new(AtomicU64::new(0)),
            catalog: Arc::new(tools),
        };

        let app = Router::new()
            .route("/files/:name", get(serve_file))
            .route("/api/tools", get(serve_catalog))
            .route("/api/update", get(serve_version_check))
            .route("/api/count", post(count_download))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test server");
        let addr = listener.local_addr().expect("No local address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn file_url(&self, name: &str) -> String {
        self.url(&format!("/files/{}", name))
    }

    /// `Range` offsets requested for `name`, in order; `None` for full requests.
    pub fn range_requests(&self, name: &str) -> Vec<Option<u64>> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(file, _)| file == name)
            .map(|(_, offset)| *offset)
            .collect()
    }

    pub fn download_count(&self) -> u64 {
        self.state.counter.load(Ordering::SeqCst)
    }
}

fn requested_offset(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes=")?
        .trim_end_matches('-')
        .parse()
        .ok()
}

async fn serve_file(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(data) = state.files.get(&name).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let offset = requested_offset(&headers);
    state.requests.lock().unwrap().push((name, offset));

    if state.failures.fetch_add(1, Ordering::SeqCst) < state.options.fail_first {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let total = data.len() as u64;
    let start = match offset {
        Some(start) if state.options.ranges => {
            if start >= total {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", total))],
                )
                    .into_response();
            }
            start
        }
        _ => 0,
    };

    let chunks: Vec<Vec<u8>> = data[start as usize..]
        .chunks(state.options.chunk_size)
        .map(<[u8]>::to_vec)
        .collect();
    let delay = state.options.chunk_delay;
    let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, std::io::Error>(Bytes::from(chunk))
    });

    let mut builder = axum::http::Response::builder().header(header::CONTENT_LENGTH, total - start);
    if state.options.ranges {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }
    if offset.is_some() && state.options.ranges {
        builder = builder.status(StatusCode::PARTIAL_CONTENT).header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, total - 1, total),
        );
    } else {
        builder = builder.status(StatusCode::OK);
    }
    builder.body(Body::from_stream(stream)).unwrap()
}

async fn serve_catalog(State(state): State<ServerState>) -> Json<Value> {
    let tools = state.catalog.as_ref().clone();
    Json(json!({ "success": true, "data": { "tools": tools } }))
}

async fn serve_version_check() -> Json<Value> {
    Json(json!({
        "version": "99.0.0",
        "min_version": "0.1.0",
        "update": { "windows": "https://example.com/toolport.exe", "macos": "https://example.com/toolport.dmg" }
    }))
}

async fn count_download(State(state): State<ServerState>, Json(body): Json<Value>) -> Json<Value> {
    let count = if body.get("tool_id").is_some() {
        state.counter.fetch_add(1, Ordering::SeqCst) + 1
    } else {
        state.counter.load(Ordering::SeqCst)
    };
    Json(json!({ "success": true, "data": { "current_downloads": count } }))
}

/// Isolated config and download directory for driving the binary.
#[allow(dead_code)]
pub struct TestContext {
    pub _temp_dir: TempDir,
    pub config_path: PathBuf,
    pub download_dir: PathBuf,
    pub bin_path: PathBuf,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.json");
        let download_dir = temp_dir.path().join("downloads");

        let bin_path = PathBuf::from(env!("CARGO_BIN_EXE_toolport"));

        Self {
            _temp_dir: temp_dir,
            config_path,
            download_dir,
            bin_path,
        }
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = Command::new(&self.bin_path);
        cmd.env("TOOLPORT_CONFIG", &self.config_path);
        cmd.env("TOOLPORT_DOWNLOAD_DIR", &self.download_dir);
        cmd.env("HOME", self._temp_dir.path());
        cmd.env("XDG_CONFIG_HOME", self._temp_dir.path().join("config"));
        cmd.env_remove("RUST_LOG");
        cmd
    }
}

#[allow(dead_code)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status,
        }
    }
}

#[allow(dead_code)]
impl CommandOutput {
    pub fn assert_success(&self) -> &Self {
        if !self.status.success() {
            panic!(
                "Command failed with status {:?}\nstdout: {}\nstderr: {}",
                self.status.code(),
                self.stdout,
                self.stderr
            );
        }
        self
    }

    pub fn assert_failure(&self) -> &Self {
        assert!(
            !self.status.success(),
            "Command unexpectedly succeeded\nstdout: {}",
            self.stdout
        );
        self
    }

    pub fn assert_stdout_contains(&self, text: &str) -> &Self {
        assert!(
            self.stdout.contains(text),
            "Stdout did not contain '{}'\nActual stdout: {}",
            text,
            self.stdout
        );
        self
    }

    pub fn assert_stderr_contains(&self, text: &str) -> &Self {
        assert!(
            self.stderr.contains(text),
            "Stderr did not contain '{}'\nActual stderr: {}",
            text,
            self.stderr
        );
        self
    }
}
