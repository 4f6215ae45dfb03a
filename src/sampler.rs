//! Point-in-time resource readings for a process tree.
//!
//! Memory is summed over the target and every live descendant. On Linux the
//! proportional (PSS), unique (USS) and shared figures come from
//! `/proc/<pid>/smaps_rollup`; elsewhere, or when that file is unreadable,
//! PSS and USS fall back to RSS and shared memory is reported as 0.
//!
//! CPU usage is the delta between two successive refreshes of the process
//! table, so taking a reading never blocks for a measurement window. The
//! first reading of a run reports 0.

use crate::gpu::{GpuQueryError, NvidiaSmi};
use crate::reading::Reading;
use std::collections::{HashMap, VecDeque};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Outcome of looking at a process that may have exited in the meantime.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe<T> {
    Present(T),
    Vanished,
}

/// Takes readings of a process tree and answers questions about its shape.
pub trait Sampler {
    /// One reading of `pid` and all of its live descendants.
    fn sample(&mut self, pid: u32, include_cpu: bool) -> Probe<Reading>;

    /// Fresh recursive enumeration of the live descendants of `pid`.
    fn descendants(&mut self, pid: u32) -> Vec<u32>;

    /// Whether the OS reports `pid` as exited but not yet reaped.
    fn is_zombie(&mut self, pid: u32) -> bool;
}

/// Memory figures in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub rss: u64,
    pub pss: u64,
    pub uss: u64,
    pub shared: u64,
}

impl MemoryUsage {
    /// Degraded figures for platforms that only expose resident memory.
    pub fn rss_only(rss: u64) -> Self {
        Self {
            rss,
            pss: rss,
            uss: rss,
            shared: 0,
        }
    }

    fn add(&mut self, other: MemoryUsage) {
        self.rss += other.rss;
        self.pss += other.pss;
        self.uss += other.uss;
        self.shared += other.shared;
    }
}

/// Parse the contents of `/proc/<pid>/smaps_rollup`. Values are in kB.
pub fn parse_smaps_rollup(text: &str) -> MemoryUsage {
    let mut usage = MemoryUsage::default();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(kb) = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        let bytes = kb * 1024;
        match key.trim() {
            "Rss" => usage.rss = bytes,
            "Pss" => usage.pss = bytes,
            "Shared_Clean" | "Shared_Dirty" => usage.shared += bytes,
            "Private_Clean" | "Private_Dirty" | "Private_Hugetlb" => usage.uss += bytes,
            _ => {}
        }
    }
    usage
}

/// Process state letter from the contents of `/proc/<pid>/stat`, e.g. `'R'` or `'Z'`.
pub fn parse_stat_state(stat: &str) -> Option<char> {
    // The command name may contain spaces and parentheses; the state follows the last ')'.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

#[cfg(target_os = "linux")]
fn read_smaps_rollup(pid: u32) -> std::io::Result<MemoryUsage> {
    let text = std::fs::read_to_string(format!("/proc/{pid}/smaps_rollup"))?;
    Ok(parse_smaps_rollup(&text))
}

/// Breadth-first walk of a parent -> children map, excluding `root` itself.
pub fn collect_descendants(children: &HashMap<u32, Vec<u32>>, root: u32) -> Vec<u32> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if child != root && !found.contains(&child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found
}

/// `Sampler` backed by sysinfo, procfs and `nvidia-smi`.
pub struct SystemSampler {
    system: System,
    gpu: Option<NvidiaSmi>,
}

impl SystemSampler {
    /// `gpu` is `None` when GPU fields should not be collected for this run.
    pub fn new(gpu: Option<NvidiaSmi>) -> Self {
        Self {
            system: System::new(),
            gpu,
        }
    }

    fn refresh_all(&mut self, include_cpu: bool) {
        let kind = if include_cpu {
            ProcessRefreshKind::nothing().with_memory().with_cpu()
        } else {
            ProcessRefreshKind::nothing().with_memory()
        };
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, kind);
    }

    fn children_map(&self) -> HashMap<u32, Vec<u32>> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            // Threads show up as tasks of their process; only count real processes.
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(pid.as_u32());
            }
        }
        children
    }

    fn memory_of(&self, pid: u32) -> Probe<MemoryUsage> {
        let Some(process) = self.system.process(Pid::from_u32(pid)) else {
            return Probe::Vanished;
        };
        let rss = process.memory();

        #[cfg(target_os = "linux")]
        {
            match read_smaps_rollup(pid) {
                Ok(usage) => Probe::Present(usage),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Probe::Vanished,
                Err(e) => {
                    tracing::debug!(pid, error = %e, "smaps_rollup unreadable, using RSS only");
                    Probe::Present(MemoryUsage::rss_only(rss))
                }
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Probe::Present(MemoryUsage::rss_only(rss))
        }
    }

    fn cpu_of(&self, pid: u32) -> f32 {
        self.system
            .process(Pid::from_u32(pid))
            .map(|p| p.cpu_usage())
            .unwrap_or(0.0)
    }

    fn gpu_fields(&mut self, reading: &mut Reading) {
        let Some(gpu) = &self.gpu else {
            return;
        };
        match gpu.query() {
            Ok(devices) => {
                for device in &devices {
                    device.write_into(reading);
                }
            }
            Err(GpuQueryError::NotFound { command }) => {
                tracing::warn!(%command, "GPU tool disappeared, no more GPU data for this run");
                self.gpu = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "GPU query failed, reading has no GPU fields");
            }
        }
    }
}

impl Sampler for SystemSampler {
    fn sample(&mut self, pid: u32, include_cpu: bool) -> Probe<Reading> {
        self.refresh_all(include_cpu);

        let Probe::Present(mut memory) = self.memory_of(pid) else {
            return Probe::Vanished;
        };
        let mut cpu = if include_cpu { self.cpu_of(pid) } else { 0.0 };

        let children = self.children_map();
        for child in collect_descendants(&children, pid) {
            match self.memory_of(child) {
                Probe::Present(usage) => {
                    memory.add(usage);
                    if include_cpu {
                        cpu += self.cpu_of(child);
                    }
                }
                Probe::Vanished => {
                    tracing::trace!(pid = child, "descendant vanished during sampling");
                }
            }
        }

        let mut reading = Reading::new();
        self.gpu_fields(&mut reading);
        reading.insert("cpu_usage", cpu);
        reading.insert("memory_usage_rss", memory.rss);
        reading.insert("memory_usage_pss", memory.pss);
        reading.insert("memory_usage_uss", memory.uss);
        reading.insert("shared_memory", memory.shared);
        reading.insert(
            "timestamp",
            chrono::Local::now()
                .format("%Y-%m-%d %H:%M:%S%.6f")
                .to_string(),
        );
        Probe::Present(reading)
    }

    fn descendants(&mut self, pid: u32) -> Vec<u32> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        collect_descendants(&self.children_map(), pid)
    }

    /// Reads procfs directly. Any refresh of the process table resets the CPU
    /// baseline that the next `sample` measures against.
    #[cfg(target_os = "linux")]
    fn is_zombie(&mut self, pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| parse_stat_state(&stat))
            == Some('Z')
    }

    /// Without procfs, `try_wait` in the supervisor is the liveness check.
    #[cfg(not(target_os = "linux"))]
    fn is_zombie(&mut self, _pid: u32) -> bool {
        false
    }
}
