//! Application-wide constants.
//!
//! Centralized location for environment variable names, wire limits and
//! timeouts used across the agent.

use std::time::Duration;

/// Environment variable carrying the pipe name the delta server listens on.
pub const ENV_PIPE_NAME: &str = "RELOAD_AGENT_PIPE_NAME";

/// Environment variable carrying the executable path of the intended target process.
pub const ENV_TARGET_PROCESS_PATH: &str = "RELOAD_AGENT_TARGET_PROCESS_PATH";

/// Environment variable toggling verbose agent logging.
pub const ENV_VERBOSE: &str = "RELOAD_AGENT_VERBOSE";

/// Environment variable overriding the connect timeout, in milliseconds.
pub const ENV_CONNECT_TIMEOUT_MS: &str = "RELOAD_AGENT_CONNECT_TIMEOUT_MS";

/// All environment variables that trigger the agent, cleared after bootstrap
/// so child processes do not attach as well.
pub const AGENT_ENV_VARS: [&str; 4] = [
    ENV_PIPE_NAME,
    ENV_TARGET_PROCESS_PATH,
    ENV_VERBOSE,
    ENV_CONNECT_TIMEOUT_MS,
];

/// Maximum frame size accepted by default (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// How long to wait for the delta server before running without hot reload.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between connection attempts while the server is not yet listening.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum path length for a Unix domain socket (macOS kernel limit).
pub const MAX_SOCKET_PATH: usize = 104;

/// Fully qualified name of the marker attribute that declares an update handler.
///
/// Matched by name, not type identity, so independently compiled copies of
/// the attribute are recognized across module boundaries.
pub const UPDATE_HANDLER_ATTRIBUTE: &str = "System.Reflection.Metadata.MetadataUpdateHandlerAttribute";

/// Handler method invoked to clear caches after code changes.
pub const CLEAR_CACHE_METHOD: &str = "ClearCache";

/// Handler method invoked to refresh application state after code changes.
pub const UPDATE_APPLICATION_METHOD: &str = "UpdateApplication";

/// Handler method invoked when a static asset changes.
pub const UPDATE_CONTENT_METHOD: &str = "UpdateContent";
