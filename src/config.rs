use crate::db::DatabaseOptions;
use crate::errors::{AppError, AppResult};
use crate::models::IdentityMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "USECASE_METRICS_CONFIG";
pub const DATA_DIR_ENV: &str = "USECASE_METRICS_DATA_DIR";
pub const BIND_ADDR_ENV: &str = "USECASE_METRICS_BIND_ADDR";
pub const DEFAULT_CONFIG_FILE: &str = "usecase-metrics.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub log_level: String,
    pub busy_timeout_ms: u64,
    pub identity: IdentityOverrides,
}

/// Per-table identity mode; unset tables are detected from their schema at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentityOverrides {
    pub metrics: Option<IdentityMode>,
    pub reported_metrics: Option<IdentityMode>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:8787".to_string(),
            log_level: "info".to_string(),
            busy_timeout_ms: 5_000,
            identity: IdentityOverrides::default(),
        }
    }
}

impl AppConfig {
    /// Reads the config file named by the environment (or the default file when present), then
    /// applies environment overrides.
    pub fn load() -> AppResult<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let mut config = match env(CONFIG_PATH_ENV).filter(|value| !value.trim().is_empty()) {
            Some(path) => Self::from_file(Path::new(path.trim()))?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::from_file(fallback)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(env);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|error| AppError::Io(format!("failed to read config {}: {}", path.display(), error)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(data_dir) = env(DATA_DIR_ENV).filter(|value| !value.trim().is_empty()) {
            self.data_dir = PathBuf::from(data_dir.trim());
        }
        if let Some(bind_addr) = env(BIND_ADDR_ENV).filter(|value| !value.trim().is_empty()) {
            self.bind_addr = bind_addr.trim().to_string();
        }
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            metrics_identity: self.identity.metrics,
            reported_metrics_identity: self.identity.reported_metrics,
        }
    }
}
