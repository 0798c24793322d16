//! capgrid.toml configuration parser.
//!
//! ```toml
//! [server]
//! port = 8470
//! data_dir = "/var/lib/capgrid"
//! workers = 4
//!
//! [scheduler]
//! lock_timeout_ms = 2000
//!
//! [[clusters]]
//! id = 1
//! org_id = 1
//! name = "edge-eu"
//! capacity = { cpu = 16000, ram = 65536, gpu = 2 }
//! ```
//!
//! Command-line flags override file values.

use std::path::{Path, PathBuf};

use capgrid_scheduler::SchedulerConfig;
use capgrid_state::ClusterSpec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    /// Clusters registered at startup unless the store already has them.
    pub clusters: Vec<ClusterSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Tokio worker threads; defaults to the number of cores.
    pub workers: Option<usize>,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8470,
            data_dir: PathBuf::from("/var/lib/capgrid"),
            workers: None,
            json_logs: false,
        }
    }
}

/// Values given on the command line, each overriding the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub lock_timeout_ms: Option<u64>,
    pub json_logs: bool,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if given, otherwise start from defaults, then apply
    /// command-line overrides.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(port) = overrides.port {
            config.server.port = port;
        }
        if let Some(data_dir) = overrides.data_dir {
            config.server.data_dir = data_dir;
        }
        if let Some(workers) = overrides.workers {
            config.server.workers = Some(workers);
        }
        if let Some(ms) = overrides.lock_timeout_ms {
            // 0 on the command line means "wait indefinitely".
            config.scheduler.lock_timeout_ms = (ms > 0).then_some(ms);
        }
        config.server.json_logs |= overrides.json_logs;

        if config.server.workers == Some(0) {
            anyhow::bail!("server.workers must be at least 1");
        }
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.server.data_dir.join("capgrid.redb")
    }
}
