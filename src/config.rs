//! Configuration schema.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Human-readable node name, reported in views.
    pub node_name: String,
    /// Address other nodes use to reach this node's database.
    pub node_incoming: String,
    /// Directory holding the saved-state file.
    pub data_dir: PathBuf,
    /// Saved-state file name inside `data_dir`.
    pub state_file: String,
    /// Preferred state-transfer donor name; empty lets the group choose.
    pub sst_donor: String,
    pub replication: ReplicationTuning,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            node_incoming: String::new(),
            data_dir: PathBuf::from("."),
            state_file: "replicator.state".to_string(),
            sst_donor: String::new(),
            replication: ReplicationTuning::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn state_file_path(&self) -> PathBuf {
        self.data_dir.join(&self.state_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationTuning {
    /// Report last-committed to the group every N-th commit or rollback.
    pub report_interval: u64,
    /// Apply retries before declaring divergence.
    pub max_apply_attempts: u32,
    /// Pause between broadcast retries on group back-pressure.
    pub broadcast_retry_ms: u64,
    /// Pause between state-transfer request retries.
    pub sst_retry_secs: u64,
    /// Pause between join retries after donating.
    pub join_retry_ms: u64,
}

impl Default for ReplicationTuning {
    fn default() -> Self {
        Self {
            report_interval: 32,
            max_apply_attempts: 10,
            broadcast_retry_ms: 1,
            sst_retry_secs: 1,
            join_retry_ms: 100,
        }
    }
}

impl ReplicationTuning {
    pub fn broadcast_retry(&self) -> Duration {
        Duration::from_millis(self.broadcast_retry_ms)
    }

    pub fn sst_retry(&self) -> Duration {
        Duration::from_secs(self.sst_retry_secs)
    }

    pub fn join_retry(&self) -> Duration {
        Duration::from_millis(self.join_retry_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    /// Extra `tracing` filter directives, overriding the verbosity default.
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    /// Log directory; defaults to `data_dir` when unset.
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
        }
    }
}
