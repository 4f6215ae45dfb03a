use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// File name of the default sample log inside the data directory.
pub const DEFAULT_LOG_NAME: &str = "gpu_logs.csv";

/// Manages the per-user `~/.gpu_monitor/` directory.
///
/// Holds the default CSV log and an optional `config.toml`. This struct
/// provides accessors for each well-known path and handles initialization.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$HOME/.gpu_monitor`, or `None` when no home directory is set.
    pub fn default_location() -> Option<Self> {
        let home = std::env::var_os("HOME").filter(|h| !h.is_empty())?;
        Some(Self::new(Path::new(&home).join(".gpu_monitor")))
    }

    /// The root directory (e.g. `~/.gpu_monitor/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the default sample log.
    pub fn log_file(&self) -> PathBuf {
        self.root.join(DEFAULT_LOG_NAME)
    }

    /// Path to the config file (e.g. `~/.gpu_monitor/config.toml`).
    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Create the root directory if missing.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        Ok(created)
    }

    /// The lexicographically last `*.csv` in the root, if any.
    pub fn latest_csv(&self) -> Option<PathBuf> {
        let pattern = self.root.join("*.csv");
        let pattern = pattern.to_str()?;
        let mut found: Vec<PathBuf> = glob::glob(pattern).ok()?.filter_map(Result::ok).collect();
        found.sort();
        found.pop()
    }
}

/// Where to log when there is no data directory at all, e.g.
/// `2024-05-01_12-00-00_gpu_logs.csv` in the working directory.
pub fn fallback_log_path(at: DateTime<Local>) -> PathBuf {
    PathBuf::from(timestamped_name(at))
}

fn timestamped_name(at: DateTime<Local>) -> String {
    format!("{}_{DEFAULT_LOG_NAME}", at.format("%Y-%m-%d_%H-%M-%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_paths() {
        let dd = DataDir::new("/home/u/.gpu_monitor");
        assert_eq!(dd.root(), Path::new("/home/u/.gpu_monitor"));
        assert_eq!(dd.log_file(), PathBuf::from("/home/u/.gpu_monitor/gpu_logs.csv"));
        assert_eq!(dd.config(), PathBuf::from("/home/u/.gpu_monitor/config.toml"));
    }

    #[test]
    fn test_fallback_log_path() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap();
        assert_eq!(
            fallback_log_path(at),
            PathBuf::from("2024-05-01_13-04-05_gpu_logs.csv")
        );
    }

    #[test]
    fn test_init_creates_once() {
        let dir = tempdir().unwrap();
        let dd = DataDir::new(dir.path().join("state"));
        assert!(dd.init().unwrap());
        assert!(dd.root().is_dir());
        assert!(!dd.init().unwrap());
    }

    #[test]
    fn test_latest_csv() {
        let dir = tempdir().unwrap();
        let dd = DataDir::new(dir.path());
        assert_eq!(dd.latest_csv(), None);

        std::fs::write(dir.path().join("2024-01-01_00-00-00_gpu_logs.csv"), "a").unwrap();
        std::fs::write(dir.path().join("2024-02-01_00-00-00_gpu_logs.csv"), "b").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "c").unwrap();
        assert_eq!(
            dd.latest_csv(),
            Some(dir.path().join("2024-02-01_00-00-00_gpu_logs.csv"))
        );
    }

    #[test]
    fn test_latest_csv_missing_root() {
        let dd = DataDir::new("/nonexistent-gpu-monitor-root");
        assert_eq!(dd.latest_csv(), None);
    }
}
