// src/credentials.rs

//! AWS credential resolution for the runner containers.
//!
//! Resolution order:
//! - static keys from the environment (only when no profile was chosen)
//! - the shared credentials file section for the active profile
//!
//! Region: explicit value > `AWS_REGION` > `AWS_DEFAULT_REGION` > config file.
//!
//! Role assumption is delegated to the `aws` CLI so no SDK is linked in.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::env::AwsCredentials;

const ROLE_ARN_PATTERN: &str =
    r"^arn:(aws|aws-cn|aws-us-gov):[a-zA-Z0-9-]+:[a-z0-9-]*:[0-9]{12}:[^:]+$";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid role ARN {0:?}")]
    InvalidRoleArn(String),

    #[error("no AWS credentials found for profile {0:?}")]
    NotFound(String),

    #[error("failed to read {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run the aws CLI (is it installed?)")]
    Spawn(#[source] std::io::Error),

    #[error("failed to assume role {role}: {message}")]
    AssumeRole { role: String, message: String },

    #[error("unexpected assume-role output")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, role_arn: Option<&str>) -> Result<AwsCredentials, CredentialError>;
}

pub fn validate_role_arn(arn: &str) -> Result<(), CredentialError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(ROLE_ARN_PATTERN).expect("static regex"));
    if re.is_match(arn) {
        Ok(())
    } else {
        Err(CredentialError::InvalidRoleArn(arn.to_string()))
    }
}

/* ---------------- shared config files ---------------- */

type Sections = BTreeMap<String, BTreeMap<String, String>>;

/// Parse the INI dialect used by `~/.aws/credentials` and `~/.aws/config`.
fn parse_ini(text: &str) -> Sections {
    let mut sections = Sections::new();
    let mut current: Option<String> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        if let (Some(section), Some((k, v))) = (&current, line.split_once('=')) {
            sections
                .entry(section.clone())
                .or_default()
                .insert(k.trim().to_string(), v.trim().to_string());
        }
    }

    sections
}

fn read_sections(path: &Path) -> Result<Sections, CredentialError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(parse_ini(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sections::new()),
        Err(source) => Err(CredentialError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/* ---------------- default resolver ---------------- */

#[derive(Debug, Clone)]
pub struct DefaultCredentialResolver {
    /// Profile chosen on the command line.
    pub profile: Option<String>,
    /// Region chosen on the command line.
    pub region: Option<String>,
    pub credentials_file: PathBuf,
    pub config_file: PathBuf,
    /// Snapshot of the relevant process environment.
    pub env: BTreeMap<String, String>,
}

const ENV_KEYS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_PROFILE",
    "AWS_REGION",
    "AWS_DEFAULT_REGION",
    "AWS_SHARED_CREDENTIALS_FILE",
    "AWS_CONFIG_FILE",
];

impl DefaultCredentialResolver {
    pub fn from_env(profile: Option<String>, region: Option<String>) -> Self {
        let env: BTreeMap<String, String> = ENV_KEYS
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .filter(|(_, v)| !v.is_empty())
            .collect();

        let aws_dir = dirs::home_dir().unwrap_or_default().join(".aws");
        let credentials_file = env
            .get("AWS_SHARED_CREDENTIALS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| aws_dir.join("credentials"));
        let config_file = env
            .get("AWS_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| aws_dir.join("config"));

        Self {
            profile,
            region,
            credentials_file,
            config_file,
            env,
        }
    }

    fn explicit_profile(&self) -> Option<&str> {
        self.profile
            .as_deref()
            .or_else(|| self.env.get("AWS_PROFILE").map(String::as_str))
    }

    fn active_profile(&self) -> &str {
        self.explicit_profile().unwrap_or("default")
    }

    pub fn resolve_region(&self) -> Result<Option<String>, CredentialError> {
        if let Some(r) = self
            .region
            .clone()
            .or_else(|| self.env.get("AWS_REGION").cloned())
            .or_else(|| self.env.get("AWS_DEFAULT_REGION").cloned())
        {
            return Ok(Some(r));
        }

        let profile = self.active_profile();
        let section = if profile == "default" {
            "default".to_string()
        } else {
            format!("profile {profile}")
        };

        Ok(read_sections(&self.config_file)?
            .get(&section)
            .and_then(|s| s.get("region").cloned()))
    }

    /// Long-lived (or session) credentials without any role assumption.
    pub fn resolve_base(&self) -> Result<AwsCredentials, CredentialError> {
        let region = self.resolve_region()?;

        if self.explicit_profile().is_none() {
            if let (Some(key), Some(secret)) = (
                self.env.get("AWS_ACCESS_KEY_ID"),
                self.env.get("AWS_SECRET_ACCESS_KEY"),
            ) {
                debug!("using credentials from environment");
                return Ok(AwsCredentials {
                    access_key_id: key.clone(),
                    secret_access_key: secret.clone(),
                    session_token: self.env.get("AWS_SESSION_TOKEN").cloned(),
                    region,
                });
            }
        }

        let profile = self.active_profile();
        let sections = read_sections(&self.credentials_file)?;
        let section = sections
            .get(profile)
            .ok_or_else(|| CredentialError::NotFound(profile.to_string()))?;

        match (
            section.get("aws_access_key_id"),
            section.get("aws_secret_access_key"),
        ) {
            (Some(key), Some(secret)) => {
                debug!(profile = %profile, "using shared credentials file");
                Ok(AwsCredentials {
                    access_key_id: key.clone(),
                    secret_access_key: secret.clone(),
                    session_token: section.get("aws_session_token").cloned(),
                    region,
                })
            }
            _ => Err(CredentialError::NotFound(profile.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleOutput {
    credentials: AssumedCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumedCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
}

fn parse_assume_role_output(
    stdout: &[u8],
    region: Option<String>,
) -> Result<AwsCredentials, CredentialError> {
    let out: AssumeRoleOutput = serde_json::from_slice(stdout)?;
    Ok(AwsCredentials {
        access_key_id: out.credentials.access_key_id,
        secret_access_key: out.credentials.secret_access_key,
        session_token: Some(out.credentials.session_token),
        region,
    })
}

async fn assume_role(base: &AwsCredentials, role_arn: &str) -> Result<AwsCredentials, CredentialError> {
    let session = uuid::Uuid::new_v4().simple().to_string();
    let session_name = format!("mwaactl-{}", &session[..8]);

    let mut cmd = Command::new("aws");
    cmd.args(["sts", "assume-role", "--output", "json"])
        .args(["--role-arn", role_arn])
        .args(["--role-session-name", &session_name])
        .env_remove("AWS_PROFILE")
        .env("AWS_ACCESS_KEY_ID", &base.access_key_id)
        .env("AWS_SECRET_ACCESS_KEY", &base.secret_access_key);

    match &base.session_token {
        Some(token) => cmd.env("AWS_SESSION_TOKEN", token),
        None => cmd.env_remove("AWS_SESSION_TOKEN"),
    };
    if let Some(region) = &base.region {
        cmd.env("AWS_REGION", region).env("AWS_DEFAULT_REGION", region);
    }

    info!(role = %role_arn, session = %session_name, "assuming role");
    let output = cmd.output().await.map_err(CredentialError::Spawn)?;

    if !output.status.success() {
        return Err(CredentialError::AssumeRole {
            role: role_arn.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_assume_role_output(&output.stdout, base.region.clone())
}

#[async_trait]
impl CredentialResolver for DefaultCredentialResolver {
    async fn resolve(&self, role_arn: Option<&str>) -> Result<AwsCredentials, CredentialError> {
        if let Some(arn) = role_arn {
            validate_role_arn(arn)?;
        }

        let base = self.resolve_base()?;

        match role_arn {
            Some(arn) => assume_role(&base, arn).await,
            None => Ok(base),
        }
    }
}
