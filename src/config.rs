use crate::types::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

pub const CONFIG_DIR_NAME: &str = ".toolport";
pub const CONFIG_FILE_NAME: &str = "config.json";

pub const VALID_KEYS: &[&str] = &[
    "download_dir",
    "catalog_url",
    "update_url",
    "counter_url",
    "progress_interval_ms",
    "speed_window_ms",
    "connect_timeout_secs",
];

pub fn get_user_config_dir() -> Result<PathBuf> {
    let path = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join(CONFIG_DIR_NAME);
    fs::create_dir_all(&path)?;
    Ok(path)
}

pub fn get_config_file_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("TOOLPORT_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let path = get_user_config_dir()?.join(CONFIG_FILE_NAME);
    tracing::debug!("Config file path: {}", path.display());
    Ok(path)
}

pub fn load_config() -> Result<ToolportConfig> {
    let config_path = get_config_file_path()?;

    let mut config = if config_path.exists() {
        let content = fs::read_to_string(&config_path).with_context(|| {
            format!("Could not read config file at {}", config_path.display())
        })?;
        serde_json::from_str(&content).with_context(|| "Could not parse config file as JSON")?
    } else {
        ToolportConfig::default()
    };

    apply_env_overrides(&mut config.settings);
    Ok(config)
}

fn apply_env_overrides(settings: &mut ToolportSettings) {
    if let Ok(dir) = std::env::var("TOOLPORT_DOWNLOAD_DIR") {
        settings.download_dir = dir;
    }
    if let Ok(url) = std::env::var("TOOLPORT_CATALOG_URL") {
        settings.catalog_url = url;
    }
    if let Ok(url) = std::env::var("TOOLPORT_UPDATE_URL") {
        settings.update_url = url;
    }
    if let Ok(url) = std::env::var("TOOLPORT_COUNTER_URL") {
        settings.counter_url = Some(url).filter(|u| !u.is_empty());
    }
}

pub fn save_config(config: &ToolportConfig) -> Result<()> {
    let config_path = get_config_file_path()?;
    if let Some(config_dir) = config_path.parent() {
        fs::create_dir_all(config_dir)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    fs::write(&config_path, content)
        .with_context(|| format!("Could not write config file at {}", config_path.display()))?;

    Ok(())
}

/// `download-dir`, `downloadDir` and `download_dir` all name the same key.
pub fn normalize_key(key: &str) -> String {
    key.replace('-', "_")
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() {
                format!("_{}", c.to_lowercase())
            } else {
                c.to_string()
            }
        })
        .collect::<String>()
        .to_lowercase()
}

pub fn get_setting(settings: &ToolportSettings, key: &str) -> Option<String> {
    let value = match normalize_key(key).as_str() {
        "download_dir" => settings.download_dir.clone(),
        "catalog_url" => settings.catalog_url.clone(),
        "update_url" => settings.update_url.clone(),
        "counter_url" => settings.counter_url.clone().unwrap_or_default(),
        "progress_interval_ms" => settings.progress_interval_ms.to_string(),
        "speed_window_ms" => settings.speed_window_ms.to_string(),
        "connect_timeout_secs" => settings.connect_timeout_secs.to_string(),
        _ => return None,
    };
    Some(value)
}

pub fn set_setting(settings: &mut ToolportSettings, key: &str, value: &str) -> Result<()> {
    let key = normalize_key(key);
    let parse_u64 = |v: &str| -> Result<u64> {
        v.trim()
            .parse::<u64>()
            .with_context(|| format!("Invalid value for '{}': expected a number", key))
    };
    match key.as_str() {
        "download_dir" => settings.download_dir = value.to_string(),
        "catalog_url" => settings.catalog_url = value.to_string(),
        "update_url" => settings.update_url = value.to_string(),
        "counter_url" => settings.counter_url = Some(value.to_string()).filter(|v| !v.is_empty()),
        "progress_interval_ms" => settings.progress_interval_ms = parse_u64(value)?,
        "speed_window_ms" => settings.speed_window_ms = parse_u64(value)?,
        "connect_timeout_secs" => settings.connect_timeout_secs = parse_u64(value)?,
        _ => anyhow::bail!(
            "'{}' is not a valid configuration setting. Valid settings: {}",
            key,
            VALID_KEYS.join(", ")
        ),
    }
    Ok(())
}

pub fn unset_setting(settings: &mut ToolportSettings, key: &str) -> Result<()> {
    let key = normalize_key(key);
    let defaults = ToolportSettings::default();
    match key.as_str() {
        "download_dir" => settings.download_dir = defaults.download_dir,
        "catalog_url" => settings.catalog_url = defaults.catalog_url,
        "update_url" => settings.update_url = defaults.update_url,
        "counter_url" => settings.counter_url = defaults.counter_url,
        "progress_interval_ms" => settings.progress_interval_ms = defaults.progress_interval_ms,
        "speed_window_ms" => settings.speed_window_ms = defaults.speed_window_ms,
        "connect_timeout_secs" => settings.connect_timeout_secs = defaults.connect_timeout_secs,
        _ => anyhow::bail!(
            "'{}' is not a valid configuration setting. Valid settings: {}",
            key,
            VALID_KEYS.join(", ")
        ),
    }
    Ok(())
}
