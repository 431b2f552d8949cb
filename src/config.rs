use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from counterbench.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BenchConfig {
    pub run: RunConfig,
    pub perf: PerfConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    pub iterations: u32,
    pub results_dir: PathBuf,
    pub test_name: Option<String>,
    pub pause_ms: u64,
}

/// The counter-collection wrapper and the run's declared counter list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PerfConfig {
    pub command: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Listening port of the measured server, checked before every launch.
    pub port: Option<u16>,
    pub discovery_attempts: u32,
    pub discovery_interval_ms: u64,
    pub exit_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    /// Send the stop signal through the sync channel after each recorded sample.
    /// Disable when the measured command itself signals (e.g. a remote `touch`).
    pub signal_server: bool,
    pub readiness: Option<ReadinessConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadinessConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,
}

fn default_readiness_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    File,
    Socket,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    pub strategy: SyncStrategy,
    pub marker: PathBuf,
    pub host: String,
    pub port: u16,
    pub poll_interval_ms: u64,
    pub connect_attempts: u32,
}

// --- Default implementations ---

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            iterations: 15,
            results_dir: PathBuf::from("Results"),
            test_name: None,
            pause_ms: 1000,
        }
    }
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            command: vec!["perf".to_string(), "stat".to_string()],
            events: [
                "cycles",
                "instructions",
                "cache-misses",
                "branch-misses",
                "page-faults",
                "context-switches",
                "cpu-migrations",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/sbin/sshd"),
            args: ["-D", "-e", "-p", "2222"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            port: Some(2222),
            discovery_attempts: 10,
            discovery_interval_ms: 500,
            exit_timeout_secs: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ssh"),
            args: Vec::new(),
            timeout_secs: 5,
            retry_delay_secs: 1,
            max_retry_delay_secs: 30,
            signal_server: true,
            readiness: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: SyncStrategy::File,
            marker: PathBuf::from("/tmp/stop_server_perf"),
            host: "127.0.0.1".to_string(),
            port: 2223,
            poll_interval_ms: 1000,
            connect_attempts: 5,
        }
    }
}

impl PerfConfig {
    /// Full wrapper argv: `<command...> -e <events> -- <target> <target args...>`.
    pub fn wrap(&self, target: &Path, target_args: &[String]) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push("-e".to_string());
        argv.push(self.events.join(","));
        argv.push("--".to_string());
        argv.push(target.to_string_lossy().into_owned());
        argv.extend(target_args.iter().cloned());
        argv
    }
}

impl ServerConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }

    /// The path following a `-f` flag in the server arguments, if any.
    pub fn config_file_arg(&self) -> Option<&str> {
        let idx = self.args.iter().position(|a| a == "-f")?;
        self.args.get(idx + 1).map(|s| s.as_str())
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl BenchConfig {
    /// Load config from a TOML file.
    ///
    /// When `allow_missing` is set and the file does not exist, defaults are used.
    pub fn load(path: &Path, allow_missing: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if allow_missing && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.run.iterations == 0 {
            return invalid("run.iterations must be greater than 0");
        }
        if self.perf.command.is_empty() {
            return invalid("perf.command must not be empty");
        }
        if self.perf.events.is_empty() {
            return invalid("perf.events must declare at least one counter");
        }
        if self.server.binary.as_os_str().is_empty() {
            return invalid("server.binary must not be empty");
        }
        if self.client.binary.as_os_str().is_empty() {
            return invalid("client.binary must not be empty");
        }
        if self.server.discovery_attempts == 0 {
            return invalid("server.discovery_attempts must be greater than 0");
        }
        if self.sync.poll_interval_ms == 0 {
            return invalid("sync.poll_interval_ms must be greater than 0");
        }
        if self.client.timeout_secs == 0 {
            return invalid("client.timeout_secs must be greater than 0");
        }
        if self.sync.strategy == SyncStrategy::Socket && self.server.port == Some(self.sync.port) {
            return invalid("sync.port must differ from server.port");
        }
        Ok(())
    }
}
