//! Leader hosts file.
//!
//! Resolves the cluster's well-known names to the current leader by
//! replacing a hosts-format file with a single line.

use std::path::{Path, PathBuf};
use steward_core::Result;
use tokio::fs;
use tracing::debug;

/// Formats the hosts line mapping `names` to `addr`.
pub fn hosts_line(addr: &str, names: &[String]) -> String {
    let mut line = addr.to_string();
    for name in names {
        line.push(' ');
        line.push_str(name);
    }
    line.push('\n');
    line
}

/// Atomically replaces the file at `path` with the line mapping `names` to
/// `addr`.
pub async fn write_hosts_entry(path: &Path, addr: &str, names: &[String]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path(path);
    fs::write(&temp_path, hosts_line(addr, names)).await?;
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    debug!(path = %path.display(), addr, "Updated leader hosts entry");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
