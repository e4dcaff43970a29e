use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// A catalog entry as returned by the remote tools endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub version: String,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
    #[serde(default)]
    pub changelog: Option<String>,
    #[serde(default)]
    pub author: Author,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Uint(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Uint(n) => n.to_string(),
    })
}

/// Installation state of a catalog tool relative to the local index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ToolStatus {
    NotDownloaded,
    Downloaded,
    NeedUpdate,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolStatus::NotDownloaded => "not-downloaded",
            ToolStatus::Downloaded => "downloaded",
            ToolStatus::NeedUpdate => "need-update",
        };
        f.write_str(s)
    }
}

/// "Tool X, version V, at path P" is present on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstalledRecord {
    pub tool_id: String,
    /// `None` when the file exists but was never recorded (placed by hand).
    pub version: Option<String>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
}

/// Manifest entry persisted in `tool-versions.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub version: String,
    #[serde(default)]
    pub tool_name: String,
    pub path: PathBuf,
    pub installed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(String);

impl DownloadId {
    pub fn generate() -> Self {
        DownloadId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DownloadId {
    fn from(s: &str) -> Self {
        DownloadId(s.to_string())
    }
}

impl From<String> for DownloadId {
    fn from(s: String) -> Self {
        DownloadId(s)
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Paused,
    Completed,
    Error,
}

impl DownloadStatus {
    pub fn is_active(self) -> bool {
        matches!(self, DownloadStatus::Downloading | DownloadStatus::Paused)
    }
}

/// Read-only projection of one transfer attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: DownloadId,
    pub tool_id: String,
    pub tool_name: String,
    pub tool_version: String,
    pub url: String,
    pub status: DownloadStatus,
    pub progress: f64,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Everything needed to start a download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub download_id: Option<DownloadId>,
    #[serde(default)]
    pub url: Option<String>,
    pub tool_id: String,
    #[serde(default)]
    pub tool_name: String,
    pub tool_version: String,
}

impl StartRequest {
    pub fn for_tool(tool: &Tool) -> Self {
        StartRequest {
            download_id: None,
            url: tool.download_url.clone(),
            tool_id: tool.id.clone(),
            tool_name: tool.name.clone(),
            tool_version: tool.version.clone(),
        }
    }
}

/// Envelope of the remote tools endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<CatalogData>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CatalogData {
    #[serde(default)]
    pub tools: Vec<Tool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionCheck {
    pub version: String,
    #[serde(default)]
    pub min_version: Option<String>,
    #[serde(default)]
    pub update: UpdateLinks,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UpdateLinks {
    #[serde(default)]
    pub windows: Option<String>,
    #[serde(default)]
    pub macos: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolportSettings {
    #[serde(default = "default_download_dir", alias = "download_path")]
    pub download_dir: String,
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    #[serde(default = "default_update_url")]
    pub update_url: String,
    /// `null` turns the download counter off.
    #[serde(default = "default_counter_url")]
    pub counter_url: Option<String>,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_speed_window_ms")]
    pub speed_window_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_download_dir() -> String {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toolport")
        .to_string_lossy()
        .to_string()
}
fn default_catalog_url() -> String {
    "https://7th.rhythmdoctor.top/api/tools/get_tools.php".to_string()
}
fn default_update_url() -> String {
    "https://7th.rhythmdoctor.top/api/update/check.php".to_string()
}
fn default_counter_url() -> Option<String> {
    Some("https://7th.rhythmdoctor.top/api/tools/update_downloadsnum.php".to_string())
}
fn default_progress_interval_ms() -> u64 {
    100
}
fn default_speed_window_ms() -> u64 {
    2000
}
fn default_connect_timeout_secs() -> u64 {
    15
}

impl Default for ToolportSettings {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            catalog_url: default_catalog_url(),
            update_url: default_update_url(),
            counter_url: default_counter_url(),
            progress_interval_ms: default_progress_interval_ms(),
            speed_window_ms: default_speed_window_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ToolportConfig {
    #[serde(default)]
    pub settings: ToolportSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
}
