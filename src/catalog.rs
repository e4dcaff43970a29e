use crate::error::{LauncherError, Result};
use crate::index::LocalIndex;
use crate::platform;
use crate::types::{CatalogResponse, Tool, ToolStatus, VersionCheck};
use crate::version;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const USER_AGENT: &str = concat!("toolport/", env!("CARGO_PKG_VERSION"));

pub struct CatalogClient {
    client: reqwest::Client,
    catalog_url: String,
    update_url: String,
    counter_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CounterResponse {
    success: bool,
    #[serde(default)]
    data: Option<CounterData>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CounterData {
    current_downloads: u64,
}

/// Unwrap the `{ success, data: { tools }, message }` envelope.
pub fn parse_catalog(body: &str) -> Result<Vec<Tool>> {
    let response: CatalogResponse = serde_json::from_str(body)
        .map_err(|e| LauncherError::Catalog(format!("unexpected catalog format: {}", e)))?;
    if !response.success {
        return Err(LauncherError::Catalog(
            response
                .message
                .unwrap_or_else(|| "catalog request was not successful".to_string()),
        ));
    }
    Ok(response.data.map(|d| d.tools).unwrap_or_default())
}

impl CatalogClient {
    pub fn new(catalog_url: &str, update_url: &str, counter_url: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            catalog_url: catalog_url.to_string(),
            update_url: update_url.to_string(),
            counter_url: counter_url.map(str::to_string),
        })
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        tracing::debug!("Fetching {}", url);
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| LauncherError::Catalog(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(LauncherError::Catalog(format!(
                "request to {} failed: {} - {}",
                url, status, body
            )));
        }
        response
            .text()
            .await
            .map_err(|e| LauncherError::Catalog(e.to_string()))
    }

    pub async fn fetch_tools(&self) -> Result<Vec<Tool>> {
        let body = self.get_text(&self.catalog_url).await?;
        let tools = parse_catalog(&body)?;
        tracing::info!("Catalog lists {} tool(s)", tools.len());
        Ok(tools)
    }

    pub async fn find_tool(&self, tool_id: &str) -> Result<Tool> {
        self.fetch_tools()
            .await?
            .into_iter()
            .find(|t| t.id == tool_id || t.name.eq_ignore_ascii_case(tool_id))
            .ok_or_else(|| {
                LauncherError::NotFound(format!("tool '{}' is not in the catalog", tool_id))
            })
    }

    pub async fn check_update(&self) -> Result<VersionCheck> {
        let body = self.get_text(&self.update_url).await?;
        serde_json::from_str(&body)
            .map_err(|e| LauncherError::Catalog(format!("unexpected version-check format: {}", e)))
    }

    /// Bump the remote download counter. Returns the new count when the
    /// server reports one; `None` when no counter endpoint is configured.
    pub async fn report_download(&self, tool_id: &str) -> Result<Option<u64>> {
        let Some(url) = &self.counter_url else {
            return Ok(None);
        };
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "tool_id": tool_id }))
            .send()
            .await
            .map_err(|e| LauncherError::Catalog(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LauncherError::Catalog(format!(
                "download counter returned {}",
                response.status()
            )));
        }
        let body: CounterResponse = response
            .json()
            .await
            .map_err(|e| LauncherError::Catalog(e.to_string()))?;
        if !body.success {
            return Err(LauncherError::Catalog(
                body.message.unwrap_or_else(|| "counter update rejected".to_string()),
            ));
        }
        Ok(body.data.map(|d| d.current_downloads))
    }
}

/// A catalog tool together with its local installation state.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolView {
    #[serde(flatten)]
    pub tool: Tool,
    pub status: ToolStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StatusFilter {
    #[default]
    All,
    Downloaded,
    NotDownloaded,
    NeedUpdate,
}

impl StatusFilter {
    fn matches(self, status: ToolStatus) -> bool {
        match self {
            StatusFilter::All => true,
            // Outdated tools are still on disk.
            StatusFilter::Downloaded => status != ToolStatus::NotDownloaded,
            StatusFilter::NotDownloaded => status == ToolStatus::NotDownloaded,
            StatusFilter::NeedUpdate => status == ToolStatus::NeedUpdate,
        }
    }
}

/// Join catalog entries with the index, keeping those that pass `filter` and
/// whose name, description or author contains `search` (case-insensitive).
pub fn tool_views(
    tools: Vec<Tool>,
    index: &LocalIndex,
    filter: StatusFilter,
    search: Option<&str>,
) -> Result<Vec<ToolView>> {
    let needle = search
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    let mut views = Vec::new();
    for tool in tools {
        if let Some(needle) = &needle {
            let haystack = format!(
                "{} {} {}",
                tool.name,
                tool.description.as_deref().unwrap_or_default(),
                tool.author.name
            )
            .to_lowercase();
            if !haystack.contains(needle.as_str()) {
                continue;
            }
        }
        let status = index.status_of(&tool)?;
        if filter.matches(status) {
            views.push(ToolView { tool, status });
        }
    }
    Ok(views)
}

/// Outcome of comparing the running launcher against the version-check payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub current_version: String,
    pub latest_version: String,
    pub needs_update: bool,
    pub force_update: bool,
    pub download_url: Option<String>,
}

pub fn evaluate_update(current: &str, check: &VersionCheck) -> UpdateStatus {
    let download_url = match platform::update_channel() {
        "macos" => check.update.macos.clone(),
        _ => check.update.windows.clone(),
    };
    UpdateStatus {
        current_version: current.to_string(),
        latest_version: check.version.clone(),
        needs_update: version::needs_app_update(current, &check.version),
        force_update: check
            .min_version
            .as_deref()
            .is_some_and(|min| version::needs_force_update(current, min)),
        download_url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateLinks;

    #[test]
    fn test_parse_catalog_envelope() {
        let body = r#"{
            "success": true,
            "data": { "tools": [
                { "id": 7, "name": "Level Packer", "version": "1.2.0",
                  "downloadUrl": "https://example.com/packer.zip",
                  "releaseDate": "2024-03-01", "downloads": 12,
                  "author": { "name": "ana" } },
                { "id": "beat-sync", "name": "Beat Sync", "version": "0.3" }
            ] }
        }"#;
        let tools = parse_catalog(body).unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].id, "7");
        assert_eq!(tools[0].download_url.as_deref(), Some("https://example.com/packer.zip"));
        assert_eq!(tools[1].id, "beat-sync");
        assert!(tools[1].download_url.is_none());
    }

    #[test]
    fn test_parse_catalog_failure_message() {
        let err = parse_catalog(r#"{"success": false, "message": "maintenance"}"#).unwrap_err();
        assert!(matches!(err, LauncherError::Catalog(ref m) if m == "maintenance"));

        assert!(parse_catalog("<html>").is_err());
        assert!(parse_catalog(r#"{"success": true}"#).unwrap().is_empty());
    }

    #[test]
    fn test_evaluate_update() {
        let check = VersionCheck {
            version: "1.4.0".to_string(),
            min_version: Some("1.2.0".to_string()),
            update: UpdateLinks {
                windows: Some("https://example.com/win.exe".to_string()),
                macos: Some("https://example.com/mac.dmg".to_string()),
            },
        };

        let old = evaluate_update("1.1.9", &check);
        assert!(old.needs_update);
        assert!(old.force_update);
        assert!(old.download_url.is_some());

        let recent = evaluate_update("1.3", &check);
        assert!(recent.needs_update);
        assert!(!recent.force_update);

        let current = evaluate_update("1.4.0", &check);
        assert!(!current.needs_update);
    }

    #[test]
    fn test_tool_views_filter_and_search() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = LocalIndex::open(dir.path()).unwrap();
        let tool = |id: &str, name: &str| Tool {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            version: "2.0".to_string(),
            downloads: 0,
            release_date: String::new(),
            icon: None,
            download_url: None,
            documentation: None,
            changelog: None,
            author: Default::default(),
        };

        let tool_dir = index.tool_dir("a").unwrap();
        std::fs::create_dir_all(&tool_dir).unwrap();
        let path = tool_dir.join("a.zip");
        std::fs::write(&path, b"x").unwrap();
        index.record_installed("a", "Alpha", "1.0", &path).unwrap();

        let tools = vec![tool("a", "Alpha"), tool("b", "Beta")];

        let all = tool_views(tools.clone(), &index, StatusFilter::All, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, ToolStatus::NeedUpdate);
        assert_eq!(all[1].status, ToolStatus::NotDownloaded);

        let downloaded = tool_views(tools.clone(), &index, StatusFilter::Downloaded, None).unwrap();
        assert_eq!(downloaded.len(), 1);
        assert_eq!(downloaded[0].tool.id, "a");

        let searched = tool_views(tools, &index, StatusFilter::All, Some("BET")).unwrap();
        assert_eq!(searched.len(), 1);
        assert_eq!(searched[0].tool.id, "b");
    }
}
