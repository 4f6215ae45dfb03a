//! Monitoring lifecycle states and the observer interface the supervisor reports through.

use std::path::Path;

/// Why the monitoring loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// The child exited on its own.
    Normal,
    /// `max_duration` elapsed.
    Timeout,
    /// The supervisor could not query the child's state.
    Error,
    /// An operator asked the monitor to stop.
    Interrupted,
}

/// Supervisor states, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Spawning,
    Running,
    Terminating(TerminationCause),
    Terminated,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorState::Spawning => f.write_str("spawning"),
            MonitorState::Running => f.write_str("running"),
            MonitorState::Terminating(TerminationCause::Normal) => {
                f.write_str("terminating_normal")
            }
            MonitorState::Terminating(TerminationCause::Timeout) => {
                f.write_str("terminating_timeout")
            }
            MonitorState::Terminating(TerminationCause::Error) => f.write_str("terminating_error"),
            MonitorState::Terminating(TerminationCause::Interrupted) => {
                f.write_str("terminating_interrupted")
            }
            MonitorState::Terminated => f.write_str("terminated"),
        }
    }
}

/// Receives lifecycle events from the supervisor.
///
/// All methods have empty defaults so observers only implement what they need.
pub trait MonitorObserver {
    fn state_changed(&mut self, _state: MonitorState) {}

    fn spawned(&mut self, _pid: u32, _command: &str) {}

    fn sampled(&mut self, _sample_count: usize) {}

    fn flushed(&mut self, _path: &Path, _rows: usize) {}

    /// A non-fatal problem; the run continues with partial data.
    fn degraded(&mut self, _what: &str, _detail: &str) {}

    fn exited(&mut self, _exit_code: i32, _cause: TerminationCause) {}
}

/// Production observer: every event becomes a tracing event.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl MonitorObserver for TracingObserver {
    fn state_changed(&mut self, state: MonitorState) {
        tracing::debug!(%state, "monitor state changed");
    }

    fn spawned(&mut self, pid: u32, command: &str) {
        tracing::info!(pid, %command, "child process started");
    }

    fn sampled(&mut self, sample_count: usize) {
        tracing::trace!(sample_count, "reading taken");
    }

    fn flushed(&mut self, path: &Path, rows: usize) {
        tracing::debug!(path = %path.display(), rows, "samples written");
    }

    fn degraded(&mut self, what: &str, detail: &str) {
        tracing::warn!(%detail, "{what}");
    }

    fn exited(&mut self, exit_code: i32, cause: TerminationCause) {
        tracing::info!(exit_code, ?cause, "child process terminated");
    }
}
