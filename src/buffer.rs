//! In-memory sample buffer with full-snapshot CSV persistence.
//!
//! Every flush rewrites the destination from the whole buffer. The header is
//! the union of all keys seen so far, in first-seen order, and a reading that
//! lacks a column gets an empty cell, so a field set that changes mid-run
//! (e.g. a GPU disappearing) never shifts values into the wrong column.
//!
//! The file is written to a temporary sibling and renamed into place, so a
//! concurrent reader only ever sees a complete snapshot.

use crate::reading::Reading;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors from writing the CSV snapshot.
#[derive(Debug)]
pub enum FlushError {
    /// Failed to create the destination directory or temp file.
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to serialize or write rows.
    Write { path: PathBuf, source: csv::Error },
    /// Failed to move the temp file over the destination.
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for FlushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushError::Create { path, source } => {
                write!(f, "failed to create {}: {source}", path.display())
            }
            FlushError::Write { path, source } => {
                write!(f, "failed to write samples to {}: {source}", path.display())
            }
            FlushError::Persist { path, source } => {
                write!(f, "failed to replace {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for FlushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlushError::Create { source, .. } => Some(source),
            FlushError::Write { source, .. } => Some(source),
            FlushError::Persist { source, .. } => Some(source),
        }
    }
}

/// Append-only ordered sequence of readings for one monitoring run.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    readings: Vec<Reading>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, reading: Reading) {
        self.readings.push(reading);
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Ordered union of keys across all buffered readings.
    pub fn header(&self) -> Vec<&str> {
        let mut header: Vec<&str> = Vec::new();
        for reading in &self.readings {
            for key in reading.keys() {
                if !header.contains(&key) {
                    header.push(key);
                }
            }
        }
        header
    }

    /// Rewrite `path` with the full buffer.
    ///
    /// Returns the number of rows written; an empty buffer writes nothing and
    /// leaves the filesystem untouched.
    pub fn flush(&self, path: &Path) -> Result<usize, FlushError> {
        if self.is_empty() {
            tracing::debug!(path = %path.display(), "no samples to write");
            return Ok(0);
        }

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| FlushError::Create {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".gpu_monitor.tmp.")
            .tempfile_in(dir)
            .map_err(|e| FlushError::Create {
                path: dir.to_path_buf(),
                source: e,
            })?;

        self.write_csv(tmp.as_file_mut())
            .map_err(|e| FlushError::Write {
                path: path.to_path_buf(),
                source: e,
            })?;

        // Temp files are created 0600.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::Permissions::from_mode(0o644);
            if let Err(e) = tmp.as_file().set_permissions(mode) {
                tracing::debug!(
                    path = %path.display(),
                    error = %e,
                    "cannot make sample log world-readable"
                );
            }
        }

        tmp.persist(path).map_err(|e| FlushError::Persist {
            path: path.to_path_buf(),
            source: e.error,
        })?;

        Ok(self.readings.len())
    }

    fn write_csv<W: Write>(&self, out: W) -> Result<(), csv::Error> {
        let header = self.header();
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(&header)?;
        for reading in &self.readings {
            writer.write_record(header.iter().map(|key| {
                reading
                    .get(key)
                    .map(ToString::to_string)
                    .unwrap_or_default()
            }))?;
        }
        writer.flush()?;
        Ok(())
    }
}
