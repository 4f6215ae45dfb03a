//! Turning the user's command string into a program and arguments.
//!
//! The command is split on whitespace. When the program is a script whose
//! extension has a configured interpreter (e.g. `train.py` -> `python`), the
//! interpreter is prepended.

use std::collections::BTreeMap;
use std::path::Path;

/// A resolved command line, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// The full command line, for logging.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Errors from resolving the command string.
#[derive(Debug, PartialEq, Eq)]
pub enum LaunchError {
    /// The command string has no program in it.
    Empty,
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Empty => write!(f, "command is empty"),
        }
    }
}

impl std::error::Error for LaunchError {}

/// Default interpreter table: file extension -> interpreter program.
pub fn default_interpreters() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("py".to_string(), "python".to_string()),
        ("sh".to_string(), "sh".to_string()),
    ])
}

/// Split `command` and prepend an interpreter when the program is a known script type.
pub fn resolve_command(
    command: &str,
    interpreters: &BTreeMap<String, String>,
) -> Result<LaunchSpec, LaunchError> {
    let mut parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        return Err(LaunchError::Empty);
    }

    let extension = Path::new(&parts[0])
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_string);

    if let Some(interpreter) = extension.and_then(|ext| interpreters.get(&ext)) {
        tracing::debug!(%interpreter, script = %parts[0], "prepending interpreter");
        parts.insert(0, interpreter.clone());
    }

    let program = parts.remove(0);
    Ok(LaunchSpec {
        program,
        args: parts,
    })
}
