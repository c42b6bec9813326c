// src/config.rs

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::installer::installed_version;

pub const DEFAULT_CONFIG_FILE: &str = "mwaactl.yaml";
pub const DEFAULT_VERSION: &str = "v2.10.3";
pub const DEFAULT_REPO_URL: &str = "https://github.com/aws/aws-mwaa-local-runner";
pub const DEFAULT_CLONE_PATH: &str = "./.aws-mwaa-local-runner";
pub const DEFAULT_DAGS_PATH: &str = ".";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5 * 60);

/// Optional project file (`mwaactl.yaml`).
///
/// Every field may be omitted. Example:
///
/// version: v2.10.3
/// clone_path: ./.aws-mwaa-local-runner
/// dags_path: .
/// port: 8080
/// wait: 5m
/// profile: dev
/// region: eu-west-1
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Local runner release tag
    #[serde(default)]
    pub version: Option<String>,

    /// Repository the release is downloaded from
    #[serde(default)]
    pub repo_url: Option<String>,

    /// Where runner files are installed (relative to the working directory)
    #[serde(default)]
    pub clone_path: Option<PathBuf>,

    /// Directory that holds `dags/` (relative to the working directory)
    #[serde(default)]
    pub dags_path: Option<PathBuf>,

    #[serde(default)]
    pub port: Option<u16>,

    /// Webserver readiness budget, e.g. `90s`, `5m`
    #[serde(default)]
    pub wait: Option<String>,

    #[serde(default)]
    pub profile: Option<String>,

    #[serde(default)]
    pub region: Option<String>,
}

impl FileConfig {
    /// Load a config file.
    ///
    /// - `explicit = false`: a missing file means "all defaults"
    /// - `explicit = true`: a missing file is an error
    pub fn load(path: &Path, explicit: bool) -> Result<Self> {
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }
}

/// Values given on the command line. They win over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub version: Option<String>,
    pub repo_url: Option<String>,
    pub port: Option<u16>,
    pub wait: Option<Duration>,
    pub profile: Option<String>,
    pub region: Option<String>,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub version: String,
    pub repo_url: String,
    /// Absolute
    pub clone_path: PathBuf,
    /// Absolute
    pub dags_path: PathBuf,
    pub port: u16,
    pub wait: Duration,
    pub profile: Option<String>,
    pub region: Option<String>,
}

impl Settings {
    /// Merge CLI > file > defaults. Relative paths resolve against `cwd`.
    ///
    /// Without an explicit version the one recorded by `local init` is used.
    pub fn resolve(file: FileConfig, cli: Overrides, cwd: &Path) -> Result<Self> {
        let clone_path = cwd.join(
            file.clone_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CLONE_PATH)),
        );
        let dags_path = cwd.join(
            file.dags_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DAGS_PATH)),
        );

        let version = cli
            .version
            .or(file.version)
            .or_else(|| installed_version(&clone_path))
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());

        let wait = match (cli.wait, file.wait) {
            (Some(w), _) => w,
            (None, Some(text)) => humantime::parse_duration(&text)
                .with_context(|| format!("Invalid wait duration {:?} in config file", text))?,
            (None, None) => DEFAULT_WAIT,
        };

        Ok(Self {
            version,
            repo_url: cli
                .repo_url
                .or(file.repo_url)
                .unwrap_or_else(|| DEFAULT_REPO_URL.to_string()),
            clone_path: normalize(&clone_path),
            dags_path: normalize(&dags_path),
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            wait,
            profile: cli.profile.or(file.profile),
            region: cli.region.or(file.region),
        })
    }
}

/// Drop `.` components so paths handed to the container engine are clean.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}
