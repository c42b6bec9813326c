// src/util.rs

//! Small helpers shared by the installer, the runner and the CLI layer.

use regex::Regex;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

/// Ensure a directory exists (create it if missing).
///
/// Used when:
/// - initialising the clone path
/// - recreating the persistent database directory
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Returns `true` if `path` exists and contains at least one entry.
///
/// A missing path counts as empty. Any other read error is returned.
pub fn is_non_empty_dir(path: &Path) -> io::Result<bool> {
    match std::fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove a directory tree (if present) and create it again, empty.
pub fn recreate_dir(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(path)
}

/// Normalise a release string for use in image tags and container names.
///
/// Example:
/// `v2.10.3` → `2_10_3`
pub fn normalize_version(version: &str) -> String {
    version
        .strip_prefix('v')
        .unwrap_or(version)
        .replace('.', "_")
}

/// Returns `true` if nothing is listening on `port` on any local interface.
pub fn is_port_free(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// First 12 characters of a container id, for display only.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Strip everything except printable ASCII and newlines.
///
/// Container logs are untrusted; this keeps terminal escape sequences
/// emitted by the application from reaching the operator's terminal.
pub fn strip_non_printable(input: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"[^\x20-\x7E\n]").expect("static regex"));
    re.replace_all(input, "").into_owned()
}

/// Open a URL in the platform's default browser.
///
/// The opener is spawned detached; only the spawn itself can fail.
pub fn open_browser(url: &str) -> io::Result<()> {
    let mut cmd = if cfg!(target_os = "macos") {
        let mut c = std::process::Command::new("open");
        c.arg(url);
        c
    } else if cfg!(target_os = "windows") {
        let mut c = std::process::Command::new("rundll32");
        c.arg("url.dll,FileProtocolHandler").arg(url);
        c
    } else {
        let mut c = std::process::Command::new("xdg-open");
        c.arg(url);
        c
    };

    cmd.stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map(|_| ())
}
