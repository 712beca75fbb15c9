//! Local duplex pipe to the delta server.
//!
//! The server owns the listening end; the agent is the single client. On
//! Unix the pipe is a Unix domain socket (owner-only permissions are set by
//! the server), on Windows a named pipe under `\\.\pipe\`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::constants::CONNECT_RETRY_INTERVAL;
#[cfg(unix)]
use crate::constants::MAX_SOCKET_PATH;

/// Client end of the pipe.
#[cfg(unix)]
pub type PipeStream = tokio::net::UnixStream;

/// Client end of the pipe.
#[cfg(windows)]
pub type PipeStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Resolve a pipe name to the socket path the server binds.
///
/// Absolute paths are used as-is; bare names live in the temp directory as
/// `reload-agent-<name>.sock`.
///
/// # Errors
///
/// Returns an error if the name is empty or the path would exceed the OS
/// socket path limit.
#[cfg(unix)]
pub fn pipe_path(name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        bail!("pipe name is empty");
    }

    let candidate = PathBuf::from(name);
    let path = if candidate.is_absolute() {
        candidate
    } else {
        std::env::temp_dir().join(format!("reload-agent-{name}.sock"))
    };

    let path_len = path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        bail!(
            "Socket path too long ({path_len} bytes, max {}): {}",
            MAX_SOCKET_PATH - 1,
            path.display()
        );
    }
    Ok(path)
}

/// Resolve a pipe name to its `\\.\pipe\` path.
#[cfg(windows)]
pub fn pipe_path(name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        bail!("pipe name is empty");
    }
    Ok(PathBuf::from(format!(r"\\.\pipe\{name}")))
}

/// Connect to the delta server, retrying until `timeout` elapses.
///
/// Returns `None` when no server answers in time. That is a normal outcome:
/// the process simply runs without hot reload.
pub async fn connect(name: &str, timeout: Duration) -> Option<PipeStream> {
    let path = match pipe_path(name) {
        Ok(path) => path,
        Err(e) => {
            log::warn!("[Pipe] Invalid pipe name '{name}': {e}");
            return None;
        }
    };

    log::debug!("[Pipe] Connecting to {}", path.display());

    let attempt = async {
        loop {
            match open(&path).await {
                Ok(stream) => return stream,
                Err(e) => {
                    log::trace!("[Pipe] Connect attempt failed: {e}");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    };

    if let Ok(stream) = tokio::time::timeout(timeout, attempt).await {
        log::debug!("[Pipe] Connected to {}", path.display());
        Some(stream)
    } else {
        log::info!(
            "[Pipe] No delta server at {} after {:?}; hot reload disabled",
            path.display(),
            timeout
        );
        None
    }
}

#[cfg(unix)]
async fn open(path: &std::path::Path) -> std::io::Result<PipeStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn open(path: &std::path::Path) -> std::io::Result<PipeStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
}
