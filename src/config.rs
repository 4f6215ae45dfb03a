use crate::gpu;
use crate::launch::default_interpreters;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from `config.toml`.
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub monitor: MonitorSection,
    pub gpu: GpuConfig,
    /// File extension -> interpreter program.
    pub interpreters: Interpreters,
    pub serve: ServeConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSection {
    pub interval_secs: f64,
    /// Absent means unbounded.
    pub max_duration_secs: Option<f64>,
    pub storing_interval_secs: u64,
    /// Absent means the data directory's default log.
    pub log_location: Option<PathBuf>,
    pub log_cpu_usage: bool,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GpuConfig {
    pub enabled: bool,
    pub command: String,
}

/// Dashboard listener for `--visualize`.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Interpreters(pub BTreeMap<String, String>);

// --- Default implementations ---

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_secs: 1.0,
            max_duration_secs: None,
            storing_interval_secs: 10,
            log_location: None,
            log_cpu_usage: false,
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: gpu::DEFAULT_COMMAND.to_string(),
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8050,
        }
    }
}

impl Default for Interpreters {
    fn default() -> Self {
        Self(default_interpreters())
    }
}

/// Values given on the command line; `None` means "not given, use the file".
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub interval: Option<f64>,
    pub max_duration: Option<f64>,
    pub storing_interval: Option<u64>,
    pub log_location: Option<PathBuf>,
    pub log_cpu_usage: bool,
}

/// Validated, immutable settings for one monitoring run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub command: String,
    pub interval: Duration,
    /// `None` = run until the child exits.
    pub max_duration: Option<Duration>,
    pub storing_interval: Duration,
    pub log_location: PathBuf,
    pub log_cpu_usage: bool,
    /// `None` = do not query the GPU tool.
    pub gpu_command: Option<String>,
    pub interpreters: BTreeMap<String, String>,
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
    Invalid {
        field: &'static str,
        reason: String,
    },
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
            ConfigError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl MonitorConfig {
    /// Load and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load an explicitly requested file, or the implicit one if it exists.
    ///
    /// An explicit file must load. A broken implicit file is reported and
    /// replaced by defaults.
    pub fn discover(explicit: Option<&Path>, implicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match implicit {
            Some(path) if path.exists() => Self::load(path).or_else(|e| {
                tracing::warn!(error = %e, "ignoring config file, using defaults");
                Ok(Self::default())
            }),
            _ => Ok(Self::default()),
        }
    }

    /// Merge CLI overrides and validate into a `RunConfig`.
    ///
    /// `default_log` is used when neither the CLI nor the file names a log location.
    pub fn resolve(
        &self,
        command: &str,
        overrides: &Overrides,
        default_log: PathBuf,
    ) -> Result<RunConfig, ConfigError> {
        if command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "command",
                reason: "must not be empty".to_string(),
            });
        }

        let interval_secs = overrides.interval.unwrap_or(self.monitor.interval_secs);
        if !interval_secs.is_finite() || interval_secs <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "interval",
                reason: format!("must be a positive number of seconds, got {interval_secs}"),
            });
        }

        let max_duration = match overrides.max_duration.or(self.monitor.max_duration_secs) {
            None => None,
            Some(secs) if secs == f64::INFINITY => None,
            Some(secs) if secs.is_nan() || secs <= 0.0 => {
                return Err(ConfigError::Invalid {
                    field: "max_duration",
                    reason: format!("must be a positive number of seconds, got {secs}"),
                });
            }
            Some(secs) => Some(Duration::try_from_secs_f64(secs).map_err(|e| {
                ConfigError::Invalid {
                    field: "max_duration",
                    reason: e.to_string(),
                }
            })?),
        };

        let storing_interval = Duration::from_secs(
            overrides
                .storing_interval
                .unwrap_or(self.monitor.storing_interval_secs),
        );

        let log_location = overrides
            .log_location
            .clone()
            .or_else(|| self.monitor.log_location.clone())
            .unwrap_or(default_log);

        Ok(RunConfig {
            command: command.to_string(),
            interval: Duration::from_secs_f64(interval_secs),
            max_duration,
            storing_interval,
            log_location,
            log_cpu_usage: overrides.log_cpu_usage || self.monitor.log_cpu_usage,
            gpu_command: self.gpu.enabled.then(|| self.gpu.command.clone()),
            interpreters: self.interpreters.0.clone(),
        })
    }
}
