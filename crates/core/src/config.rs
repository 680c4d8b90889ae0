use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Limits applied by the job registry and controllers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest grid a single job may expand to.
    pub max_variants: usize,
    /// Worker pool size when a request does not set `maxcpus`.
    pub default_maxcpus: usize,
    /// Hard cap on a job's worker pool.
    pub max_maxcpus: usize,
    /// Seconds without a completed unit before a running job is flagged stalled.
    pub stall_window_secs: u64,
    /// Capacity of each controller's command channel.
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_variants: 100_000,
            default_maxcpus: 1,
            max_maxcpus: 64,
            stall_window_secs: 600,
            command_buffer: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/stratlab.db".to_string(),
            max_connections: 5,
        }
    }
}

/// External backtest program invoked once per unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Per-call timeout; 0 disables it.
    pub timeout_secs: u64,
    pub working_dir: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "backtest-runner".to_string(),
            args: Vec::new(),
            timeout_secs: 0,
            working_dir: None,
        }
    }
}
