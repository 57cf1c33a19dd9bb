//! Monitor configuration
//!
//! Immutable for the supervisor's lifetime; assembled through a builder
//! that validates required fields before any engine is spawned.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fimtrack_core::prelude::*;

/// Statement the engine schedules for periodic event enumeration,
/// also the supervisor's "all events" query.
pub(crate) const FILE_EVENTS_QUERY: &str = "SELECT * FROM file_events;";

const DEFAULT_ENGINE_BINARY: &str = "osqueryi";
const DEFAULT_DATABASE_PATH: &str = "/var/tmp/osquery_data/osquery.db";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a supervised query engine instance
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    monitor_dirs: Vec<String>,
    config_path: PathBuf,
    database_path: PathBuf,
    engine_binary: PathBuf,
    max_retries: u32,
    query_timeout: Duration,
}

impl MonitorConfig {
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::default()
    }

    pub fn monitor_dirs(&self) -> &[String] {
        &self.monitor_dirs
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn engine_binary(&self) -> &Path {
        &self.engine_binary
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Write the engine's configuration file.
    ///
    /// Contains a fixed schedule entry enumerating file events every five
    /// minutes plus the monitored directory set. Rewritten before every
    /// start so directory changes take effect on restart.
    pub(crate) fn write_engine_config(&self) -> Result<()> {
        let config = serde_json::json!({
            "schedule": {
                "file_events": {
                    "query": FILE_EVENTS_QUERY,
                    "interval": 300,
                }
            },
            "file_paths": {
                "homes": self.monitor_dirs,
            },
            "etc": ["/etc/%%"],
            "tmp": ["/tmp/%%"],
        });

        let rendered = serde_json::to_string_pretty(&config)?;
        std::fs::write(&self.config_path, rendered)?;
        Ok(())
    }

    /// Arguments for the engine subprocess invocation
    pub(crate) fn engine_args(&self) -> Vec<String> {
        vec![
            format!("--config_path={}", self.config_path.display()),
            format!("--database_path={}", self.database_path.display()),
            "--disable_events=false".to_string(),
            "--enable_file_events=true".to_string(),
            "--force".to_string(),
            "--json".to_string(),
        ]
    }
}

/// Builder for [`MonitorConfig`]
///
/// `config_path` is required; everything else has an engine-appropriate
/// default. Validation happens once in [`build`](Self::build) so a
/// constructed config is always usable.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfigBuilder {
    monitor_dirs: Vec<String>,
    config_path: Option<PathBuf>,
    database_path: Option<PathBuf>,
    engine_binary: Option<PathBuf>,
    max_retries: Option<u32>,
    query_timeout: Option<Duration>,
}

impl MonitorConfigBuilder {
    pub fn monitor_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.monitor_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn engine_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_binary = Some(path.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<MonitorConfig> {
        let config_path = self
            .config_path
            .ok_or_else(|| Error::config("engine config path is required"))?;

        let engine_binary = self
            .engine_binary
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_BINARY));
        if engine_binary.as_os_str().is_empty() {
            return Err(Error::config("engine binary must not be empty"));
        }

        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries == 0 {
            return Err(Error::config("max_retries must be at least 1"));
        }

        Ok(MonitorConfig {
            monitor_dirs: self.monitor_dirs,
            config_path,
            database_path: self
                .database_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            engine_binary,
            max_retries,
            query_timeout: self.query_timeout.unwrap_or(DEFAULT_QUERY_TIMEOUT),
        })
    }
}
