use crate::types::PlatformInfo;
use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::Command;
use std::thread::JoinHandle;

pub fn get_system_info() -> PlatformInfo {
    let os = std::env::consts::OS.to_string();
    let arch = std::env::consts::ARCH.to_string();

    let normalized_arch = match arch.as_str() {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        _ => arch,
    };

    PlatformInfo {
        os,
        arch: normalized_arch,
    }
}

/// Key of the self-update link for this platform (`windows` or `macos`).
pub fn update_channel() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else {
        "windows"
    }
}

fn opener_command(path: &Path) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "start", ""]).arg(path);
        cmd
    } else if cfg!(target_os = "macos") {
        let mut cmd = Command::new("open");
        cmd.arg(path);
        cmd
    } else {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(path);
        cmd
    }
}

/// Start `cmd` and reap it on a background thread so it never lingers as a zombie.
fn spawn_detached(mut cmd: Command) -> std::io::Result<JoinHandle<()>> {
    let mut child = cmd.spawn()?;
    Ok(std::thread::spawn(move || match child.wait() {
        Ok(status) if !status.success() => tracing::debug!("Opener exited with {}", status),
        Ok(_) => {}
        Err(e) => tracing::debug!("Could not wait for opener: {}", e),
    }))
}

/// Hand a file to the desktop's default handler without waiting for it.
pub fn open_path(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("{} does not exist", path.display()));
    }
    let cmd = opener_command(path);
    tracing::debug!("Opening with: {:?}", cmd);
    spawn_detached(cmd).map_err(|e| anyhow!("Could not open {}: {}", path.display(), e))?;
    Ok(())
}
