// src/installer.rs

//! One-shot installation of the local runner file tree.
//!
//! A tagged revision is fetched into memory, then every file is classified:
//! - tooling / CI paths are skipped
//! - workflow definitions (`dags*`) land next to the invoking shell
//! - everything else lands under the clone path

use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::util::{ensure_dir, is_non_empty_dir};

/// File recording which release a clone path was initialised with.
pub const VERSION_FILE: &str = ".mwaactl-version";

/// Persistent database directory inside the clone path.
pub const DB_DATA_DIR: &str = "db-data";

const SKIPPED_PREFIXES: &[&str] = &["mwaa-local-env", ".github"];
const DAGS_PREFIX: &str = "dags";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("path {0:?} already exists and is not empty")]
    NonEmptyTarget(PathBuf),

    #[error("refusing to write unsafe path {0:?}")]
    UnsafePath(String),

    #[error("failed to download {url}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} failed with HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("failed to unpack release archive")]
    Archive(#[source] std::io::Error),

    #[error("failed to write {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> InstallError + '_ {
    move |source| InstallError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One file of a fetched revision, path relative to the repository root
/// with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    pub path: String,
    pub contents: Vec<u8>,
    pub mode: u32,
}

#[cfg(test)]
impl TreeFile {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode: 0o644,
        }
    }
}

/// Where a versioned file tree comes from.
#[async_trait]
pub trait TreeSource: Send + Sync {
    async fn fetch(&self, version: &str) -> Result<Vec<TreeFile>, InstallError>;
}

/* ---------------- release tarball source ---------------- */

/// Fetches `<repo>/archive/<version>.tar.gz` over HTTPS.
pub struct ArchiveSource {
    repo_url: String,
    client: reqwest::Client,
}

impl ArchiveSource {
    pub fn new(repo_url: &str) -> Self {
        let repo_url = repo_url
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .to_string();
        Self {
            repo_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn archive_url(&self, version: &str) -> String {
        format!("{}/archive/{version}.tar.gz", self.repo_url)
    }

    /// Decode a gzipped tarball, dropping the single top-level directory.
    pub fn unpack(bytes: &[u8]) -> Result<Vec<TreeFile>, InstallError> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut files = Vec::new();

        for entry in archive.entries().map_err(InstallError::Archive)? {
            let mut entry = entry.map_err(InstallError::Archive)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let path = entry.path().map_err(InstallError::Archive)?.into_owned();
            let relative = path
                .components()
                .skip(1)
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if relative.is_empty() {
                continue;
            }

            let mode = entry.header().mode().unwrap_or(0o644);
            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(InstallError::Archive)?;

            files.push(TreeFile {
                path: relative,
                contents,
                mode,
            });
        }

        Ok(files)
    }
}

#[async_trait]
impl TreeSource for ArchiveSource {
    async fn fetch(&self, version: &str) -> Result<Vec<TreeFile>, InstallError> {
        let url = self.archive_url(version);
        info!(url = %url, "downloading local runner release");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| InstallError::Download {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::HttpStatus {
                url,
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| InstallError::Download {
                url: url.clone(),
                source,
            })?;

        Self::unpack(&bytes)
    }
}

/* ---------------- installer ---------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Skip,
    Dags,
    Clone,
}

pub fn classify(path: &str) -> Destination {
    if SKIPPED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        Destination::Skip
    } else if path.starts_with(DAGS_PREFIX) {
        Destination::Dags
    } else {
        Destination::Clone
    }
}

fn is_safe(path: &str) -> bool {
    !path.is_empty() && Path::new(path).components().all(|c| matches!(c, Component::Normal(_)))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub clone_files: usize,
    pub dags_files: usize,
    pub skipped: usize,
}

pub struct Installer {
    /// Root for runner files.
    pub clone_path: PathBuf,
    /// Root for workflow definitions.
    pub dags_path: PathBuf,
    pub version: String,
}

impl Installer {
    /// Fetch `version` from `source` and lay it out on disk.
    ///
    /// Refuses to touch a non-empty clone path. Nothing is written if any
    /// path in the tree is unsafe.
    pub async fn run(&self, source: &dyn TreeSource) -> Result<InstallReport, InstallError> {
        if is_non_empty_dir(&self.clone_path).map_err(io_err(&self.clone_path))? {
            return Err(InstallError::NonEmptyTarget(self.clone_path.clone()));
        }

        let files = source.fetch(&self.version).await?;

        if let Some(bad) = files.iter().find(|f| !is_safe(&f.path)) {
            return Err(InstallError::UnsafePath(bad.path.clone()));
        }

        let mut report = InstallReport::default();
        for file in &files {
            let root = match classify(&file.path) {
                Destination::Skip => {
                    report.skipped += 1;
                    continue;
                }
                Destination::Dags => {
                    report.dags_files += 1;
                    &self.dags_path
                }
                Destination::Clone => {
                    report.clone_files += 1;
                    &self.clone_path
                }
            };
            write_file(root, file)?;
        }

        let db_data = self.clone_path.join(DB_DATA_DIR);
        ensure_dir(&db_data).map_err(io_err(&db_data))?;

        let marker = self.clone_path.join(VERSION_FILE);
        std::fs::write(&marker, format!("{}\n", self.version)).map_err(io_err(&marker))?;

        info!(
            clone_path = %self.clone_path.display(),
            files = report.clone_files,
            dags = report.dags_files,
            "local runner installed"
        );
        Ok(report)
    }
}

/// Version recorded by a previous install, if any.
pub fn installed_version(clone_path: &Path) -> Option<String> {
    std::fs::read_to_string(clone_path.join(VERSION_FILE))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn write_file(root: &Path, file: &TreeFile) -> Result<(), InstallError> {
    let target = root.join(&file.path);
    if let Some(parent) = target.parent() {
        ensure_dir(parent).map_err(io_err(parent))?;
    }

    std::fs::write(&target, &file.contents).map_err(io_err(&target))?;

    #[cfg(unix)]
    if file.mode & 0o111 != 0 {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(file.mode & 0o7777))
            .map_err(io_err(&target))?;
    }

    debug!(path = %target.display(), "wrote file");
    Ok(())
}
