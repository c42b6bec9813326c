// src/compose.rs

//! Minimal reader for `docker-compose` service definitions.
//!
//! Only `image` and `environment` are decoded; the runner uses them to
//! discover the dependency (database) container without hardcoding it.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("failed to read compose file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse compose YAML")]
    Decode(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Compose {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub environment: Environment,
}

/// `environment:` accepts both list (`- KEY=VALUE`) and mapping form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    List(Vec<String>),
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::List(Vec::new())
    }
}

impl Environment {
    /// Ordered `KEY=VALUE` entries.
    pub fn to_vars(&self) -> Vec<String> {
        match self {
            Environment::List(items) => items.clone(),
            Environment::Map(map) => map
                .iter()
                .map(|(k, v)| format!("{k}={}", scalar_to_string(v.as_ref())))
                .collect(),
        }
    }
}

fn scalar_to_string(value: Option<&serde_yaml::Value>) -> String {
    match value {
        None | Some(serde_yaml::Value::Null) => String::new(),
        Some(serde_yaml::Value::String(s)) => s.clone(),
        Some(serde_yaml::Value::Bool(b)) => b.to_string(),
        Some(serde_yaml::Value::Number(n)) => n.to_string(),
        Some(other) => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

impl Compose {
    pub fn parse(text: &str) -> Result<Self, ComposeError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ComposeError> {
        let text = std::fs::read_to_string(path).map_err(|source| ComposeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn service_image(&self, name: &str) -> Result<&str, ComposeError> {
        self.service(name).map(|s| s.image.as_str())
    }

    pub fn service_environment(&self, name: &str) -> Result<Vec<String>, ComposeError> {
        self.service(name).map(|s| s.environment.to_vars())
    }

    fn service(&self, name: &str) -> Result<&ServiceConfig, ComposeError> {
        self.services
            .get(name)
            .ok_or_else(|| ComposeError::ServiceNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
services:
  web:
    image: nginx:latest
    environment:
      - ENV=production
      - DEBUG=false
  postgres:
    image: postgres:13
    environment:
      - POSTGRES_USER=airflow
      - POSTGRES_PASSWORD=airflow
      - POSTGRES_DB=airflow
"#;

    #[test]
    fn reads_image_and_environment() {
        let compose = Compose::parse(SAMPLE).unwrap();

        assert_eq!(compose.service_image("postgres").unwrap(), "postgres:13");
        assert_eq!(
            compose.service_environment("postgres").unwrap(),
            vec!["POSTGRES_USER=airflow", "POSTGRES_PASSWORD=airflow", "POSTGRES_DB=airflow"]
        );
        assert_eq!(compose.service_image("web").unwrap(), "nginx:latest");
    }

    #[test]
    fn unknown_service_is_reported_by_name() {
        let compose = Compose::parse(SAMPLE).unwrap();

        let err = compose.service_image("unknown").unwrap_err();
        assert!(matches!(err, ComposeError::ServiceNotFound(ref n) if n == "unknown"));
        assert_eq!(err.to_string(), "service unknown not found");

        assert!(compose.service_environment("unknown").is_err());
    }

    #[test]
    fn mapping_environment_is_flattened() {
        let compose = Compose::parse(
            "services:\n  db:\n    image: pg\n    environment:\n      USER: admin\n      PORT: 5432\n      EMPTY:\n",
        )
        .unwrap();

        assert_eq!(
            compose.service_environment("db").unwrap(),
            vec!["EMPTY=", "PORT=5432", "USER=admin"]
        );
    }

    #[test]
    fn malformed_yaml_fails_fast() {
        let err = Compose::parse("services: [unterminated").unwrap_err();
        assert!(matches!(err, ComposeError::Decode(_)));
    }

    #[test]
    fn loads_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("docker-compose-local.yml");
        std::fs::write(&path, SAMPLE).unwrap();

        let compose = Compose::load(&path).unwrap();
        assert!(compose.services.contains_key("web"));

        let missing = Compose::load(&tmp.path().join("missing.yml")).unwrap_err();
        assert!(matches!(missing, ComposeError::Read { .. }));
    }
}
