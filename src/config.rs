//! Settings parser for fimtrack.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use fimtrack_core::prelude::*;
use fimtrack_monitor::MonitorConfig;

const CONFIG_FILENAME: &str = "fimtrack.toml";
const SYSTEM_CONFIG_DIR: &str = "/etc/filemod-tracker";

/// Agent settings, merged from the first settings file found.
///
/// Every field has a default mirroring the stock engine deployment, so a
/// missing file yields a runnable configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub monitor: MonitorSettings,
    pub daemon: DaemonSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the HTTP surface binds to
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Directories whose file events the engine tracks
    pub directories: Vec<String>,
    /// Engine executable; a bare name is resolved on PATH
    pub engine_binary: String,
    /// Where the generated engine configuration is written
    pub config_path: PathBuf,
    /// Engine's local event database
    pub database_path: PathBuf,
    /// Restart budget for the fault watcher
    pub max_retries: u32,
    /// Upper bound on a single engine query
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Period of the maintenance tick
    pub tick_secs: u64,
    /// Command queue depth before backpressure kicks in
    pub queue_capacity: usize,
    /// How long shutdown may take before in-flight work is abandoned
    pub shutdown_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            monitor: MonitorSettings::default(),
            daemon: DaemonSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            directories: vec![".".to_string()],
            engine_binary: "osqueryi".to_string(),
            config_path: PathBuf::from("/var/tmp/osquery_data/osquery.conf"),
            database_path: PathBuf::from("/var/tmp/osquery_data/osquery.db"),
            max_retries: 3,
            query_timeout_secs: 30,
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            tick_secs: 10,
            queue_capacity: 100,
            shutdown_timeout_secs: 5,
        }
    }
}

impl Settings {
    /// Load settings from an explicit path, or search the usual locations.
    ///
    /// Returns defaults if no file exists or the file can't be parsed.
    pub fn load(path: Option<&Path>) -> Settings {
        let candidate = match path {
            Some(explicit) => Some(explicit.to_path_buf()),
            None => Self::search_paths().into_iter().find(|p| p.exists()),
        };

        let Some(config_path) = candidate else {
            debug!("No settings file found, using defaults");
            return Settings::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    debug!("Loaded settings from {:?}", config_path);
                    settings
                }
                Err(e) => {
                    warn!("Failed to parse {:?}: {}", config_path, e);
                    Settings::default()
                }
            },
            Err(e) => {
                warn!("Failed to read {:?}: {}", config_path, e);
                Settings::default()
            }
        }
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILENAME)];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("filemod-tracker").join(CONFIG_FILENAME));
        }
        paths.push(Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILENAME));
        paths
    }

    /// Build the supervisor configuration out of these settings
    pub fn monitor_config(&self) -> Result<MonitorConfig> {
        MonitorConfig::builder()
            .monitor_dirs(self.monitor.directories.iter().cloned())
            .config_path(&self.monitor.config_path)
            .database_path(&self.monitor.database_path)
            .engine_binary(&self.monitor.engine_binary)
            .max_retries(self.monitor.max_retries)
            .query_timeout(Duration::from_secs(self.monitor.query_timeout_secs))
            .build()
    }
}
