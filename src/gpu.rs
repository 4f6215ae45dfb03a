//! GPU readings via the `nvidia-smi` command-line tool.
//!
//! The tool is asked for `index,timestamp,name,memory.total,memory.used,utilization.gpu`
//! as CSV without header or units. A missing tool is reported as
//! `GpuQueryError::NotFound` so callers can skip GPU fields for the run.

use crate::reading::{Reading, Value};
use std::process::Command;

pub const DEFAULT_COMMAND: &str = "nvidia-smi";

const QUERY_ARGS: [&str; 2] = [
    "--query-gpu=index,timestamp,name,memory.total,memory.used,utilization.gpu",
    "--format=csv,noheader,nounits",
];

/// One device line of `nvidia-smi` output.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuReading {
    pub index: String,
    pub timestamp: String,
    pub name: String,
    pub memory_total: u64,
    pub memory_used: u64,
    /// Integer percentage, or the raw text when the driver reports e.g. `[N/A]`.
    pub utilization: Value,
}

impl GpuReading {
    /// Append this device's `gpu_{index}_*` fields to a reading.
    pub fn write_into(&self, reading: &mut Reading) {
        let prefix = format!("gpu_{}", self.index);
        reading.insert(format!("{prefix}_timestamp"), self.timestamp.as_str());
        reading.insert(format!("{prefix}_name"), self.name.as_str());
        reading.insert(format!("{prefix}_memory_total"), self.memory_total);
        reading.insert(format!("{prefix}_memory_used"), self.memory_used);
        reading.insert(format!("{prefix}_utilization_gpu"), self.utilization.clone());
    }
}

/// Errors from querying the GPU tool.
#[derive(Debug)]
pub enum GpuQueryError {
    /// The tool binary is not installed / not on PATH.
    NotFound { command: String },
    /// The tool could not be run for another reason.
    Io {
        command: String,
        source: std::io::Error,
    },
    /// The tool ran but exited unsuccessfully.
    Failed { command: String, status: String },
    /// A line did not match the expected six-column layout.
    Malformed { line: String },
}

impl std::fmt::Display for GpuQueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuQueryError::NotFound { command } => write!(f, "{command} command not found"),
            GpuQueryError::Io { command, source } => {
                write!(f, "failed to run {command}: {source}")
            }
            GpuQueryError::Failed { command, status } => {
                write!(f, "{command} exited unsuccessfully ({status})")
            }
            GpuQueryError::Malformed { line } => write!(f, "malformed GPU line: {line:?}"),
        }
    }
}

impl std::error::Error for GpuQueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuQueryError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Handle to the vendor tool.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    command: String,
}

impl NvidiaSmi {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the tool once with no arguments to see whether it is usable.
    pub fn is_available(&self) -> bool {
        match Command::new(&self.command).output() {
            Ok(output) => output.status.success(),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(error = %e, command = %self.command, "GPU tool probe failed");
                }
                false
            }
        }
    }

    /// Query all devices.
    pub fn query(&self) -> Result<Vec<GpuReading>, GpuQueryError> {
        let output = Command::new(&self.command)
            .args(QUERY_ARGS)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => GpuQueryError::NotFound {
                    command: self.command.clone(),
                },
                _ => GpuQueryError::Io {
                    command: self.command.clone(),
                    source: e,
                },
            })?;

        if !output.status.success() {
            return Err(GpuQueryError::Failed {
                command: self.command.clone(),
                status: output.status.to_string(),
            });
        }

        parse_query_output(&String::from_utf8_lossy(&output.stdout))
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND)
    }
}

/// Parse `--format=csv,noheader,nounits` output. Blank lines are ignored.
pub fn parse_query_output(text: &str) -> Result<Vec<GpuReading>, GpuQueryError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Result<GpuReading, GpuQueryError> {
    let malformed = || GpuQueryError::Malformed {
        line: line.to_string(),
    };

    let cols: Vec<&str> = line.split(',').map(str::trim).collect();
    let [index, timestamp, name, total, used, utilization] = cols.as_slice() else {
        return Err(malformed());
    };

    let utilization = match utilization.parse::<u64>() {
        Ok(v) => Value::Int(v),
        Err(_) => Value::Text(utilization.to_string()),
    };

    Ok(GpuReading {
        index: index.to_string(),
        timestamp: timestamp.to_string(),
        name: name.to_string(),
        memory_total: total.parse().map_err(|_| malformed())?,
        memory_used: used.parse().map_err(|_| malformed())?,
        utilization,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const TWO_GPUS: &str = "\
0, 2024/05/01 12:00:00.123, NVIDIA A100-SXM4-40GB, 40960, 1024, 37
1, 2024/05/01 12:00:00.124, NVIDIA A100-SXM4-40GB, 40960, 0, [N/A]
";

    #[test]
    fn test_parse_two_devices() {
        let gpus = parse_query_output(TWO_GPUS).unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, "0");
        assert_eq!(gpus[0].name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(gpus[0].memory_total, 40960);
        assert_eq!(gpus[0].memory_used, 1024);
        assert_eq!(gpus[0].utilization, Value::Int(37));
        assert_eq!(gpus[1].utilization, Value::Text("[N/A]".to_string()));
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_query_output("").unwrap().is_empty());
        assert!(parse_query_output("\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_malformed_line() {
        let err = parse_query_output("0, only, three").unwrap_err();
        assert!(matches!(err, GpuQueryError::Malformed { .. }));

        let err = parse_query_output("0, ts, name, lots, 1, 2").unwrap_err();
        assert!(matches!(err, GpuQueryError::Malformed { .. }));
    }

    #[test]
    fn test_write_into_reading() {
        let gpus = parse_query_output(TWO_GPUS).unwrap();
        let mut reading = Reading::new();
        for gpu in &gpus {
            gpu.write_into(&mut reading);
        }
        let keys: Vec<_> = reading.keys().collect();
        assert_eq!(
            &keys[..5],
            &[
                "gpu_0_timestamp",
                "gpu_0_name",
                "gpu_0_memory_total",
                "gpu_0_memory_used",
                "gpu_0_utilization_gpu",
            ]
        );
        assert_eq!(reading.len(), 10);
        assert_eq!(reading.get("gpu_1_memory_used"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_query_missing_tool() {
        let smi = NvidiaSmi::new("nonexistent-gpu-tool-xyz");
        assert!(!smi.is_available());
        let err = smi.query().unwrap_err();
        assert!(matches!(err, GpuQueryError::NotFound { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_query_fake_tool() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("fake-smi");
        std::fs::write(
            &tool,
            "#!/bin/sh\necho '0, 2024/05/01 12:00:00.000, Fake GPU, 8192, 512, 5'\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let smi = NvidiaSmi::new(tool.to_string_lossy());
        assert!(smi.is_available());
        let gpus = smi.query().unwrap();
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].name, "Fake GPU");
        assert_eq!(gpus[0].memory_used, 512);
    }

    #[test]
    fn test_query_failing_tool() {
        let smi = NvidiaSmi::new("false");
        let err = smi.query().unwrap_err();
        assert!(matches!(err, GpuQueryError::Failed { .. }));
    }
}
