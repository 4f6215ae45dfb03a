mod buffer;
mod config;
mod data_dir;
mod gpu;
mod launch;
mod observer;
mod reading;
mod sampler;
#[cfg(feature = "serve")]
mod serve;
mod signals;
mod supervisor;

use clap::Parser;
use config::{MonitorConfig, Overrides};
use data_dir::{fallback_log_path, DataDir};
use gpu::NvidiaSmi;
use observer::TracingObserver;
use sampler::SystemSampler;
use signals::Shutdown;
use std::path::PathBuf;
use supervisor::Supervisor;
use tracing_subscriber::EnvFilter;

/// Exit status when the configuration cannot be loaded or is invalid.
const CONFIG_FAILURE_EXIT: i32 = 2;
/// Exit status when the command could not be started (shell convention).
const SPAWN_FAILURE_EXIT: i32 = 127;

/// Run a command and log its CPU, memory, and GPU usage to CSV until it
/// exits, hits the time limit, or is interrupted.
#[derive(Parser, Debug)]
#[command(name = "gpu-monitor", version, about)]
pub struct Cli {
    /// The command to run, e.g. "python train.py --epochs 3"
    #[arg(value_name = "COMMAND", required_unless_present = "visualize")]
    command: Option<String>,

    /// Seconds between samples (default: from config, 1.0)
    #[arg(long)]
    interval: Option<f64>,

    /// Seconds before the command is killed; "inf" for no limit
    #[arg(long = "max_duration")]
    max_duration: Option<f64>,

    /// Seconds between CSV flushes (default: from config, 10)
    #[arg(long = "storing_interval")]
    storing_interval: Option<u64>,

    /// CSV output path (default: ~/.gpu_monitor/gpu_logs.csv)
    #[arg(long = "log_location")]
    log_location: Option<PathBuf>,

    /// Also record CPU usage of the process tree
    #[arg(long = "log_cpu_usage")]
    log_cpu_usage: bool,

    /// Serve a dashboard of an existing log instead of running a command
    #[arg(long)]
    visualize: bool,

    /// Dashboard port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Dashboard bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Config file path (default: ~/.gpu_monitor/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            interval: self.interval,
            max_duration: self.max_duration,
            storing_interval: self.storing_interval,
            log_location: self.log_location.clone(),
            log_cpu_usage: self.log_cpu_usage,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = run(cli).await;
    std::process::exit(process_exit_code(code));
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("GPU_MONITOR_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn run(cli: Cli) -> i32 {
    let data_dir = DataDir::default_location();
    if let Some(dd) = &data_dir {
        match dd.init() {
            Ok(true) => tracing::debug!(path = %dd.root().display(), "created data directory"),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                path = %dd.root().display(),
                error = %e,
                "cannot create data directory"
            ),
        }
    }

    let implicit_config = data_dir.as_ref().map(DataDir::config);
    let discovered = MonitorConfig::discover(cli.config.as_deref(), implicit_config.as_deref());
    let file_config = match discovered {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            eprintln!("gpu-monitor: {e}");
            return CONFIG_FAILURE_EXIT;
        }
    };

    let default_log = default_log_location(data_dir.as_ref());

    if cli.visualize {
        return visualize(&cli, &file_config, data_dir.as_ref(), default_log).await;
    }

    let Some(command) = cli.command.as_deref() else {
        eprintln!("gpu-monitor: no command given");
        return CONFIG_FAILURE_EXIT;
    };

    let run_config = match file_config.resolve(command, &cli.overrides(), default_log) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            eprintln!("gpu-monitor: {e}");
            return CONFIG_FAILURE_EXIT;
        }
    };
    tracing::debug!(?run_config, "resolved settings");

    let gpu = run_config
        .gpu_command
        .as_deref()
        .map(NvidiaSmi::new)
        .filter(|smi| {
            let available = smi.is_available();
            if !available {
                tracing::warn!("{} command not found. Can not log GPU data.", smi.command());
            }
            available
        });

    let shutdown = Shutdown::new();
    if let Err(e) = shutdown.install() {
        tracing::warn!(error = %e, "cannot install signal handlers, Ctrl-C will not stop cleanly");
    }

    let log_location = run_config.log_location.clone();
    let sampler = SystemSampler::new(gpu);
    let mut supervisor = Supervisor::new(run_config, sampler, TracingObserver, shutdown);
    match supervisor.run_and_monitor().await {
        Ok(report) => {
            tracing::info!(
                exit_code = report.exit_code,
                cause = ?report.cause,
                samples = report.samples,
                elapsed_secs = report.elapsed.as_secs_f64(),
                log = %log_location.display(),
                "monitoring finished"
            );
            report.exit_code
        }
        Err(e) => {
            tracing::error!(error = %e, "monitoring aborted");
            eprintln!("gpu-monitor: {e}");
            SPAWN_FAILURE_EXIT
        }
    }
}

fn default_log_location(data_dir: Option<&DataDir>) -> PathBuf {
    data_dir
        .map(DataDir::log_file)
        .unwrap_or_else(|| fallback_log_path(chrono::Local::now()))
}

/// Pick the log to chart: an explicit location, else the default log, else
/// the newest CSV in the data directory.
#[cfg_attr(not(feature = "serve"), allow(dead_code))]
fn visualize_target(
    explicit: Option<PathBuf>,
    default_log: PathBuf,
    data_dir: Option<&DataDir>,
) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if default_log.exists() {
        return default_log;
    }
    data_dir.and_then(DataDir::latest_csv).unwrap_or(default_log)
}

#[cfg(feature = "serve")]
async fn visualize(
    cli: &Cli,
    file_config: &MonitorConfig,
    data_dir: Option<&DataDir>,
    default_log: PathBuf,
) -> i32 {
    let explicit = cli
        .log_location
        .clone()
        .or_else(|| file_config.monitor.log_location.clone());
    let target = visualize_target(explicit, default_log, data_dir);
    let bind = cli.bind.as_deref().unwrap_or(&file_config.serve.bind);
    let port = cli.port.unwrap_or(file_config.serve.port);

    if !target.exists() {
        tracing::warn!(path = %target.display(), "log file does not exist yet");
    }
    match serve::run(target, bind, port).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "dashboard server failed");
            eprintln!("gpu-monitor: {e}");
            1
        }
    }
}

#[cfg(not(feature = "serve"))]
async fn visualize(
    _cli: &Cli,
    _file_config: &MonitorConfig,
    _data_dir: Option<&DataDir>,
    _default_log: PathBuf,
) -> i32 {
    eprintln!("gpu-monitor: built without the dashboard; rebuild with `--features serve`");
    0
}

/// Map a monitor exit code onto a process exit status: a child killed by
/// signal N (reported as -N) exits 128+N, like a shell.
fn process_exit_code(code: i32) -> i32 {
    if code < 0 {
        128 + code.saturating_neg()
    } else {
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_help_exits_cleanly() {
        let err = Cli::try_parse_from(["gpu-monitor", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_command_required() {
        let err = Cli::try_parse_from(["gpu-monitor"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_visualize_needs_no_command() {
        let cli = Cli::try_parse_from(["gpu-monitor", "--visualize", "--port", "9000"]).unwrap();
        assert!(cli.visualize);
        assert_eq!(cli.command, None);
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn test_underscore_flags() {
        let cli = Cli::try_parse_from([
            "gpu-monitor",
            "python train.py --epochs 3",
            "--interval",
            "0.5",
            "--max_duration",
            "inf",
            "--storing_interval",
            "30",
            "--log_location",
            "/tmp/run.csv",
            "--log_cpu_usage",
        ])
        .unwrap();
        assert_eq!(cli.command.as_deref(), Some("python train.py --epochs 3"));
        assert_eq!(cli.interval, Some(0.5));
        assert_eq!(cli.max_duration, Some(f64::INFINITY));

        let overrides = cli.overrides();
        assert_eq!(overrides.storing_interval, Some(30));
        assert_eq!(overrides.log_location, Some(PathBuf::from("/tmp/run.csv")));
        assert!(overrides.log_cpu_usage);

        let run = MonitorConfig::default()
            .resolve(cli.command.as_deref().unwrap(), &overrides, PathBuf::from("x.csv"))
            .unwrap();
        assert_eq!(run.interval, Duration::from_millis(500));
        assert_eq!(run.max_duration, None);
        assert_eq!(run.storing_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_process_exit_code() {
        assert_eq!(process_exit_code(0), 0);
        assert_eq!(process_exit_code(3), 3);
        assert_eq!(process_exit_code(-9), 137);
        assert_eq!(process_exit_code(-15), 143);
    }

    #[test]
    fn test_default_log_location() {
        let dd = DataDir::new("/data");
        assert_eq!(default_log_location(Some(&dd)), PathBuf::from("/data/gpu_logs.csv"));
        let fallback = default_log_location(None);
        assert!(fallback.to_string_lossy().ends_with("_gpu_logs.csv"));
    }

    #[test]
    fn test_visualize_target() {
        let dir = tempdir().unwrap();
        let dd = DataDir::new(dir.path());
        let default_log = dd.log_file();

        let explicit = PathBuf::from("/elsewhere/run.csv");
        assert_eq!(
            visualize_target(Some(explicit.clone()), default_log.clone(), Some(&dd)),
            explicit
        );

        // Nothing on disk: fall back to the default name.
        assert_eq!(visualize_target(None, default_log.clone(), Some(&dd)), default_log);

        let older = dir.path().join("2024-01-01_00-00-00_gpu_logs.csv");
        std::fs::write(&older, "timestamp\n").unwrap();
        assert_eq!(visualize_target(None, default_log.clone(), Some(&dd)), older);

        std::fs::write(&default_log, "timestamp\n").unwrap();
        assert_eq!(visualize_target(None, default_log.clone(), Some(&dd)), default_log);
    }
}
