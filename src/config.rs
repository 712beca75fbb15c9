//! Environment-supplied agent configuration.
//!
//! The launcher that starts the target process sets:
//!
//! - `RELOAD_AGENT_PIPE_NAME` - pipe the delta server listens on (required)
//! - `RELOAD_AGENT_TARGET_PROCESS_PATH` - executable the agent should attach to
//! - `RELOAD_AGENT_VERBOSE` - `1`/`true`/`yes` for debug logging
//! - `RELOAD_AGENT_CONNECT_TIMEOUT_MS` - connect timeout override
//!
//! They are read once and then cleared so child processes do not attach too.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::constants::{
    AGENT_ENV_VARS, DEFAULT_CONNECT_TIMEOUT, ENV_CONNECT_TIMEOUT_MS, ENV_PIPE_NAME,
    ENV_TARGET_PROCESS_PATH, ENV_VERBOSE,
};

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Pipe name (or absolute socket path) of the delta server.
    pub pipe_name: String,
    /// Executable path the agent should attach to; empty matches any process.
    pub target_process_path: String,
    /// Whether debug logging is enabled.
    pub verbose: bool,
    /// How long to wait for the server before giving up.
    pub connect_timeout: Duration,
}

impl AgentConfig {
    /// Config for `pipe_name` with defaults for everything else.
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Self {
            pipe_name: pipe_name.into(),
            target_process_path: String::new(),
            verbose: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Read the process environment.
    ///
    /// Returns `Ok(None)` when the pipe name is not set: the process was not
    /// launched for hot reload.
    ///
    /// # Errors
    ///
    /// Returns an error if the connect timeout is not a number.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the connect timeout is not a number.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let Some(pipe_name) = lookup(ENV_PIPE_NAME).filter(|name| !name.is_empty()) else {
            return Ok(None);
        };

        let mut config = Self::new(pipe_name);
        config.target_process_path = lookup(ENV_TARGET_PROCESS_PATH).unwrap_or_default();
        config.verbose = lookup(ENV_VERBOSE).is_some_and(|v| parse_flag(&v));

        if let Some(raw) = lookup(ENV_CONNECT_TIMEOUT_MS) {
            let millis: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_CONNECT_TIMEOUT_MS} value: {raw:?}"))?;
            config.connect_timeout = Duration::from_millis(millis);
        }

        Ok(Some(config))
    }

    /// Remove the agent's variables from the process environment.
    pub fn clear_env() {
        for key in AGENT_ENV_VARS {
            std::env::remove_var(key);
        }
    }

    /// Whether the running executable is the one this config targets.
    pub fn is_target_process(&self) -> bool {
        is_current_executable(&self.target_process_path)
    }
}

/// Whether the running executable matches `expected` (see [`paths_match`]).
pub fn is_current_executable(expected: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    match std::env::current_exe() {
        Ok(exe) => paths_match(&exe, expected),
        Err(e) => {
            log::warn!("[Config] Cannot determine current executable: {e}");
            false
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Compare an executable path with the expected target path.
///
/// A trailing `.exe` or `.dll` is ignored on both sides, so an app host and
/// the module it runs compare equal. Comparison is case-insensitive on
/// Windows. An empty expected path matches anything.
pub fn paths_match(actual: &Path, expected: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    normalize(actual) == normalize(Path::new(expected))
}

fn normalize(path: &Path) -> String {
    let is_binary_ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe") || ext.eq_ignore_ascii_case("dll"));
    let stem: PathBuf = if is_binary_ext {
        path.with_extension("")
    } else {
        path.to_path_buf()
    };

    let text = stem.to_string_lossy().into_owned();
    if cfg!(windows) {
        text.replace('/', "\\").to_lowercase()
    } else {
        text
    }
}
