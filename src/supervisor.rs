//! Child process lifecycle: spawn, timed sampling loop, termination of the
//! whole process tree, exit-code relay.
//!
//! States run `Spawning -> Running -> Terminating(cause) -> Terminated`.
//! Whatever ends `Running` (child exit, timeout, a failed state query, or an
//! operator interrupt), the terminating step always writes the sample buffer
//! one final time and kills every descendant and the child before reaping it.

use crate::buffer::SampleBuffer;
use crate::config::RunConfig;
use crate::launch::{resolve_command, LaunchError};
use crate::observer::{MonitorObserver, MonitorState, TerminationCause};
use crate::sampler::{Probe, Sampler};
use crate::signals::Shutdown;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;

/// Summary of a finished monitoring run.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorReport {
    /// The child's own exit code, or `-signal` when it was killed by a signal.
    pub exit_code: i32,
    pub cause: TerminationCause,
    /// Number of readings taken.
    pub samples: usize,
    /// Wall-clock time from spawn to reaping the child.
    pub elapsed: Duration,
}

/// Fatal errors: the child never started, so there is nothing to monitor.
#[derive(Debug)]
pub enum MonitorError {
    /// The command string could not be turned into a program.
    Launch(LaunchError),
    /// The program could not be started (not found, not executable, ...).
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Launch(e) => write!(f, "invalid command: {e}"),
            MonitorError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Launch(e) => Some(e),
            MonitorError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Exit code of a reaped child: its own code, or `-signal` if a signal ended it.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

/// SIGKILL a single process. A process that is already gone is not an error.
pub fn kill_pid(pid: u32) -> Probe<()> {
    let Ok(raw) = i32::try_from(pid) else {
        return Probe::Vanished;
    };
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => Probe::Present(()),
        Err(Errno::ESRCH) => Probe::Vanished,
        Err(e) => {
            tracing::debug!(pid, error = %e, "failed to kill process");
            Probe::Vanished
        }
    }
}

fn kill_group(pgid: u32) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!(pgid, error = %e, "failed to kill process group"),
    }
}

/// Kill every descendant of `pid`, then the child, then its process group,
/// and reap the child.
///
/// Safe to call on a child that has already exited or was already
/// terminated; the returned status is the one recorded at reaping.
pub async fn terminate_tree<S: Sampler>(
    sampler: &mut S,
    child: &mut Child,
    pid: u32,
) -> std::io::Result<ExitStatus> {
    // Once reaped, `pid` may belong to an unrelated process. Its former
    // children were re-parented and are only reachable through the group.
    if let Some(status) = child.try_wait()? {
        tracing::trace!(pid, "child already reaped, killing its group only");
        kill_group(pid);
        return Ok(status);
    }

    for descendant in sampler.descendants(pid) {
        if kill_pid(descendant) == Probe::Vanished {
            tracing::trace!(pid = descendant, "descendant already gone");
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::trace!(pid, error = %e, "child already exited");
    }

    // The child leads its own process group, which also holds re-parented stragglers.
    kill_group(pid);

    child.wait().await
}

/// Runs one command under supervision.
pub struct Supervisor<S, O> {
    config: RunConfig,
    sampler: S,
    observer: O,
    shutdown: Shutdown,
}

impl<S: Sampler, O: MonitorObserver> Supervisor<S, O> {
    pub fn new(config: RunConfig, sampler: S, observer: O, shutdown: Shutdown) -> Self {
        Self {
            config,
            sampler,
            observer,
            shutdown,
        }
    }

    #[cfg(test)]
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Spawn the command, monitor it until it exits, times out or is
    /// interrupted, and return its exit code.
    ///
    /// Only a failure to start the child is an error. Everything that goes
    /// wrong afterwards is reported to the observer and absorbed.
    pub async fn run_and_monitor(&mut self) -> Result<MonitorReport, MonitorError> {
        self.transition(MonitorState::Spawning);

        let launch = resolve_command(&self.config.command, &self.config.interpreters)
            .map_err(MonitorError::Launch)?;

        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .process_group(0) // New process group so stragglers can be killed together
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MonitorError::Spawn {
                program: launch.program.clone(),
                source: e,
            })?;

        let started = Instant::now();
        let Some(pid) = child.id() else {
            let status = child.wait().await.ok();
            return Err(MonitorError::Spawn {
                program: launch.program,
                source: std::io::Error::other(format!(
                    "child exited before its pid could be read ({status:?})"
                )),
            });
        };
        self.observer.spawned(pid, &launch.display());

        self.transition(MonitorState::Running);
        let mut buffer = SampleBuffer::new();
        let cause = self.monitor_loop(&mut child, pid, started, &mut buffer).await;

        self.transition(MonitorState::Terminating(cause));
        self.persist(&buffer);

        let exit_code = match terminate_tree(&mut self.sampler, &mut child, pid).await {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                self.observer
                    .degraded("failed to reap child process", &e.to_string());
                -1
            }
        };
        self.observer.exited(exit_code, cause);
        self.transition(MonitorState::Terminated);

        Ok(MonitorReport {
            exit_code,
            cause,
            samples: buffer.len(),
            elapsed: started.elapsed(),
        })
    }

    async fn monitor_loop(
        &mut self,
        child: &mut Child,
        pid: u32,
        started: Instant,
        buffer: &mut SampleBuffer,
    ) -> TerminationCause {
        // Ticks keep a fixed cadence; the time spent sampling is part of the interval.
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => return TerminationCause::Interrupted,
                _ = ticker.tick() => {}
            }

            if self
                .config
                .max_duration
                .is_some_and(|max| started.elapsed() >= max)
            {
                return TerminationCause::Timeout;
            }

            match self.is_alive(child, pid) {
                Ok(true) => {}
                Ok(false) => return TerminationCause::Normal,
                Err(e) => {
                    self.observer
                        .degraded("failed to query child process state", &e.to_string());
                    return TerminationCause::Error;
                }
            }

            match self.sampler.sample(pid, self.config.log_cpu_usage) {
                Probe::Present(reading) => {
                    buffer.append(reading);
                    self.observer.sampled(buffer.len());
                }
                Probe::Vanished => {
                    self.observer
                        .degraded("child vanished before it could be sampled", &pid.to_string());
                }
            }

            if last_flush.elapsed() >= self.config.storing_interval {
                self.persist(buffer);
                last_flush = Instant::now();
            }
        }
    }

    /// Running means: not yet reaped, and not a zombie waiting to be reaped.
    fn is_alive(&mut self, child: &mut Child, pid: u32) -> std::io::Result<bool> {
        if child.try_wait()?.is_some() {
            return Ok(false);
        }
        Ok(!self.sampler.is_zombie(pid))
    }

    fn persist(&mut self, buffer: &SampleBuffer) {
        match buffer.flush(&self.config.log_location) {
            Ok(0) => {}
            Ok(rows) => self.observer.flushed(&self.config.log_location, rows),
            Err(e) => self
                .observer
                .degraded("failed to write samples", &e.to_string()),
        }
    }

    fn transition(&mut self, state: MonitorState) {
        self.observer.state_changed(state);
    }
}
