//! Local installation index.
//!
//! Installed artifacts live at `<root>/<tool_id>/<filename>`, and the version
//! each one was installed at is kept in `<root>/tool-versions.json`. Nothing is
//! cached in memory: every query rescans the directory so that files deleted
//! or dropped in by hand are picked up immediately.

use crate::error::{LauncherError, Result};
use crate::types::{InstalledRecord, ManifestEntry, Tool, ToolStatus, VersionInfo};
use crate::version;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

pub const MANIFEST_FILE_NAME: &str = "tool-versions.json";
pub const PARTIAL_EXTENSION: &str = "part";

pub struct LocalIndex {
    root: PathBuf,
    // Serializes manifest read-modify-write cycles.
    write_lock: Mutex<()>,
}

fn is_partial(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some(PARTIAL_EXTENSION)
}

/// Reject values that cannot be used as a single path component.
pub fn validate_component(what: &str, value: &str) -> Result<()> {
    let bad = value.trim().is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', ':'])
        || value.chars().any(char::is_control);
    if bad {
        return Err(LauncherError::InvalidInput(format!(
            "'{}' is not a usable {}",
            value, what
        )));
    }
    Ok(())
}

pub fn validate_tool_id(tool_id: &str) -> Result<()> {
    validate_component("tool identifier", tool_id)
}

impl LocalIndex {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        tracing::debug!("Local index root: {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tool_dir(&self, tool_id: &str) -> Result<PathBuf> {
        validate_tool_id(tool_id)?;
        Ok(self.root.join(tool_id))
    }

    /// Where an in-flight download of `filename` keeps its bytes.
    pub fn partial_path(
        &self,
        tool_id: &str,
        filename: &str,
        download_id: &str,
    ) -> Result<PathBuf> {
        Ok(self
            .tool_dir(tool_id)?
            .join(format!("{}.{}.{}", filename, download_id, PARTIAL_EXTENSION)))
    }

    fn artifacts(&self, tool_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.tool_dir(tool_id)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && !is_partial(path))
            .collect();
        files.sort();
        Ok(files)
    }

    fn read_manifest(&self) -> Result<BTreeMap<String, ManifestEntry>> {
        let path = self.root.join(MANIFEST_FILE_NAME);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        match serde_json::from_str(&content) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable version manifest at {}: {}",
                    path.display(),
                    e
                );
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_manifest(&self, manifest: &BTreeMap<String, ManifestEntry>) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(serde_json::to_string_pretty(manifest)?.as_bytes())?;
        tmp.flush()?;
        tmp.persist(self.root.join(MANIFEST_FILE_NAME))
            .map_err(|e| LauncherError::Storage(e.to_string()))?;
        Ok(())
    }

    /// All tools with an artifact on disk, freshly scanned.
    pub fn list(&self) -> Result<Vec<InstalledRecord>> {
        let manifest = self.read_manifest()?;
        let mut records: BTreeMap<String, InstalledRecord> = BTreeMap::new();

        for entry in WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || is_partial(path) {
                continue;
            }
            let Some(tool_id) = path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
            else {
                continue;
            };
            records.entry(tool_id.clone()).or_insert_with(|| InstalledRecord {
                version: manifest.get(&tool_id).map(|m| m.version.clone()),
                tool_id,
                path: path.to_path_buf(),
            });
        }

        Ok(records.into_values().collect())
    }

    pub fn get(&self, tool_id: &str) -> Result<Option<InstalledRecord>> {
        let Some(path) = self.artifacts(tool_id)?.into_iter().next() else {
            return Ok(None);
        };
        let manifest = self.read_manifest()?;
        Ok(Some(InstalledRecord {
            tool_id: tool_id.to_string(),
            version: manifest.get(tool_id).map(|m| m.version.clone()),
            path,
        }))
    }

    pub fn exists(&self, tool_id: &str) -> Result<bool> {
        Ok(!self.artifacts(tool_id)?.is_empty())
    }

    /// Recorded versions for every tool whose artifact is still present.
    pub fn versions(&self) -> Result<BTreeMap<String, VersionInfo>> {
        let manifest = self.read_manifest()?;
        let mut out = BTreeMap::new();
        for (tool_id, entry) in manifest {
            if validate_tool_id(&tool_id).is_err() || !self.exists(&tool_id)? {
                continue;
            }
            out.insert(
                tool_id,
                VersionInfo {
                    version: entry.version,
                },
            );
        }
        Ok(out)
    }

    pub fn record_installed(
        &self,
        tool_id: &str,
        tool_name: &str,
        version: &str,
        path: &Path,
    ) -> Result<()> {
        validate_tool_id(tool_id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.upsert(tool_id, tool_name, version, path)
    }

    fn upsert(&self, tool_id: &str, tool_name: &str, version: &str, path: &Path) -> Result<()> {
        let mut manifest = self.read_manifest()?;
        manifest.insert(
            tool_id.to_string(),
            ManifestEntry {
                version: version.to_string(),
                tool_name: tool_name.to_string(),
                path: path.to_path_buf(),
                installed_at: Utc::now().to_rfc3339(),
            },
        );
        self.write_manifest(&manifest)?;
        tracing::debug!("Recorded {} v{} at {}", tool_id, version, path.display());
        Ok(())
    }

    /// Move a finished partial into place, replacing any earlier artifact of
    /// the same tool, and record its version.
    pub fn install_artifact(
        &self,
        tool_id: &str,
        tool_name: &str,
        version: &str,
        partial: &Path,
        filename: &str,
    ) -> Result<PathBuf> {
        if filename.is_empty() || filename.contains(['/', '\\']) || is_partial(Path::new(filename))
        {
            return Err(LauncherError::InvalidInput(format!(
                "'{}' is not a usable file name",
                filename
            )));
        }
        let dir = self.tool_dir(tool_id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        fs::create_dir_all(&dir)?;
        for old in self.artifacts(tool_id)? {
            tracing::debug!("Replacing previous artifact {}", old.display());
            fs::remove_file(&old)?;
        }

        let target = dir.join(filename);
        fs::rename(partial, &target)?;
        self.upsert(tool_id, tool_name, version, &target)?;

        tracing::info!("Installed {} v{} to {}", tool_id, version, target.display());
        Ok(target)
    }

    /// Delete the local artifact of a tool. `Ok(false)` when nothing was there.
    pub fn remove(&self, tool_id: &str) -> Result<bool> {
        let dir = self.tool_dir(tool_id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let files = self.artifacts(tool_id)?;
        for file in &files {
            fs::remove_file(file)?;
        }

        let mut manifest = self.read_manifest()?;
        if manifest.remove(tool_id).is_some() {
            self.write_manifest(&manifest)?;
        }

        // Only succeeds once no partial downloads remain inside.
        let _ = fs::remove_dir(&dir);

        if files.is_empty() {
            tracing::debug!("No local file for {}", tool_id);
        } else {
            tracing::info!("Removed local files for {}", tool_id);
        }
        Ok(!files.is_empty())
    }

    pub fn status_of(&self, tool: &Tool) -> Result<ToolStatus> {
        let record = self.get(&tool.id)?;
        Ok(version::classify(&tool.version, record.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalIndex) {
        let dir = TempDir::new().unwrap();
        let index = LocalIndex::open(dir.path().join("downloads")).unwrap();
        (dir, index)
    }

    fn place(index: &LocalIndex, tool_id: &str, name: &str) -> PathBuf {
        let dir = index.tool_dir(tool_id).unwrap();
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, b"payload").unwrap();
        path
    }

    #[test]
    fn test_empty_index() {
        let (_dir, index) = setup();
        assert!(index.list().unwrap().is_empty());
        assert!(!index.exists("1").unwrap());
        assert!(index.versions().unwrap().is_empty());
    }

    #[test]
    fn test_record_and_list() {
        let (_dir, index) = setup();
        let path = place(&index, "42", "editor.zip");
        index.record_installed("42", "Editor", "1.0", &path).unwrap();

        let records = index.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tool_id, "42");
        assert_eq!(records[0].version.as_deref(), Some("1.0"));
        assert_eq!(records[0].path, path);
        assert_eq!(index.versions().unwrap()["42"].version, "1.0");
    }

    #[test]
    fn test_record_is_idempotent_upsert() {
        let (_dir, index) = setup();
        let path = place(&index, "a", "a.exe");
        index.record_installed("a", "A", "1.0", &path).unwrap();
        index.record_installed("a", "A", "1.0", &path).unwrap();
        index.record_installed("a", "A", "1.1", &path).unwrap();
        assert_eq!(index.get("a").unwrap().unwrap().version.as_deref(), Some("1.1"));
        assert_eq!(index.list().unwrap().len(), 1);
    }

    #[test]
    fn test_partials_are_not_installed() {
        let (_dir, index) = setup();
        let partial = index.partial_path("a", "a.zip", "job1").unwrap();
        fs::create_dir_all(partial.parent().unwrap()).unwrap();
        fs::write(&partial, b"half").unwrap();
        assert!(!index.exists("a").unwrap());
        assert!(index.list().unwrap().is_empty());
    }

    #[test]
    fn test_install_artifact_replaces_previous() {
        let (_dir, index) = setup();
        place(&index, "a", "tool-1.0.zip");

        let partial = index.partial_path("a", "tool-1.1.zip", "job2").unwrap();
        fs::write(&partial, b"new").unwrap();
        let target = index
            .install_artifact("a", "A", "1.1", &partial, "tool-1.1.zip")
            .unwrap();

        assert!(!partial.exists());
        assert_eq!(fs::read(&target).unwrap(), b"new");
        let records = index.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, target);
        assert_eq!(records[0].version.as_deref(), Some("1.1"));
    }

    #[test]
    fn test_remove_missing_is_not_an_error() {
        let (_dir, index) = setup();
        assert!(!index.remove("nope").unwrap());
    }

    #[test]
    fn test_remove_deletes_file_and_record() {
        let (_dir, index) = setup();
        let path = place(&index, "a", "a.zip");
        index.record_installed("a", "A", "2.0", &path).unwrap();

        assert!(index.remove("a").unwrap());
        assert!(!path.exists());
        assert!(!index.exists("a").unwrap());
        assert!(index.versions().unwrap().is_empty());
    }

    #[test]
    fn test_file_deleted_by_hand_is_noticed() {
        let (_dir, index) = setup();
        let path = place(&index, "a", "a.zip");
        index.record_installed("a", "A", "2.0", &path).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(!index.exists("a").unwrap());
        assert!(index.versions().unwrap().is_empty());
    }

    #[test]
    fn test_unrecorded_file_has_no_version() {
        let (_dir, index) = setup();
        place(&index, "manual", "thing.exe");
        let record = index.get("manual").unwrap().unwrap();
        assert_eq!(record.version, None);
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let (_dir, index) = setup();
        for bad in ["", "..", "a/b", "a\\b", "c:"] {
            assert!(matches!(
                index.tool_dir(bad),
                Err(LauncherError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_status_of() {
        let (_dir, index) = setup();
        let tool = |version: &str| Tool {
            id: "5".to_string(),
            name: "Five".to_string(),
            description: None,
            version: version.to_string(),
            downloads: 0,
            release_date: String::new(),
            icon: None,
            download_url: None,
            documentation: None,
            changelog: None,
            author: Default::default(),
        };
        assert_eq!(index.status_of(&tool("1.0")).unwrap(), ToolStatus::NotDownloaded);

        let path = place(&index, "5", "five.zip");
        index.record_installed("5", "Five", "1.0", &path).unwrap();
        assert_eq!(index.status_of(&tool("1.1")).unwrap(), ToolStatus::NeedUpdate);
        assert_eq!(index.status_of(&tool("1.0")).unwrap(), ToolStatus::Downloaded);
    }
}
