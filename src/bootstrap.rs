//! Process entry point.
//!
//! The host runtime calls [`initialize`] once, very early, before any user
//! code runs. The agent then:
//!
//! 1. reads its configuration from the environment and sets up logging
//! 2. checks that this process is the one the launcher meant to attach to
//! 3. clears its environment variables so child processes do not attach
//! 4. connects, sends capabilities and applies the initial updates while the
//!    caller is blocked
//! 5. keeps receiving updates on a background runtime
//!
//! Nothing here ever propagates an error into the host: every failure is
//! logged and the process continues without hot reload.

use std::sync::{Arc, Mutex, Once, OnceLock, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{self, AgentConfig};
use crate::constants::ENV_TARGET_PROCESS_PATH;
use crate::engine::host::HostRuntime;
use crate::engine::DeltaEngine;
use crate::session::Session;
use crate::transport::PipeStream;

/// How long [`Agent::shutdown`] waits for runtime threads to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A running agent: its runtime and steady-state session task.
pub struct Agent {
    runtime: Runtime,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    engine: Arc<DeltaEngine>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Connect, apply initial updates, and start the steady-state loop.
    ///
    /// Blocks until the initial updates are applied. Returns `None` when the
    /// process should run without hot reload: no server answered, or the
    /// initial exchange failed.
    ///
    /// Must not be called from inside an async runtime.
    pub fn start(config: &AgentConfig, host: Arc<dyn HostRuntime>) -> Option<Self> {
        Self::start_with_cancellation(config, host, CancellationToken::new())
    }

    /// Like [`Agent::start`], with an external shutdown signal.
    ///
    /// Cancelling before the initial updates are applied abandons the
    /// connection and returns `None`.
    pub fn start_with_cancellation(
        config: &AgentConfig,
        host: Arc<dyn HostRuntime>,
        cancel: CancellationToken,
    ) -> Option<Self> {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("reload-agent")
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("[Agent] Failed to start runtime: {e}");
                return None;
            }
        };

        let engine = Arc::new(DeltaEngine::new(host));
        let session = runtime.block_on(open_session(config, Arc::clone(&engine), &cancel))?;

        let task = runtime.spawn(receive_updates(session, cancel.clone()));
        log::info!("[Agent] Hot reload active on '{}'", config.pipe_name);

        Some(Self {
            runtime,
            cancel,
            task,
            engine,
        })
    }

    /// Whether the steady-state loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// The engine applying this agent's updates.
    pub fn engine(&self) -> &Arc<DeltaEngine> {
        &self.engine
    }

    /// Stop receiving updates, close the channel and stop the runtime.
    ///
    /// Must not be called from inside an async runtime.
    pub fn shutdown(self) {
        let Self {
            runtime,
            cancel,
            task,
            ..
        } = self;

        cancel.cancel();
        if let Err(e) = runtime.block_on(task) {
            log::warn!("[Agent] Session task ended abnormally: {e}");
        }
        runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        log::debug!("[Agent] Shut down");
    }
}

/// Connect and run the blocking phases of the session.
async fn open_session(
    config: &AgentConfig,
    engine: Arc<DeltaEngine>,
    cancel: &CancellationToken,
) -> Option<Session<PipeStream>> {
    let mut session = tokio::select! {
        () = cancel.cancelled() => return None,
        session = Session::connect(&config.pipe_name, config.connect_timeout, engine) => session?,
    };

    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            log::debug!("[Agent] Cancelled during startup");
            Err(crate::error::AgentError::Cancelled)
        }
        result = async {
            session.initialize().await?;
            session.drain_initial_updates().await
        } => result,
    };

    match result {
        Ok(()) => Some(session),
        Err(e) => {
            log::warn!("[Agent] Hot reload unavailable: {e}");
            session.close().await;
            None
        }
    }
}

/// Steady-state loop; errors end hot reload but never reach the host.
async fn receive_updates(session: Session<PipeStream>, cancel: CancellationToken) {
    match session.run(cancel).await {
        Ok(()) => log::debug!("[Agent] Session ended"),
        Err(e) => log::warn!("[Agent] Hot reload stopped: {e}"),
    }
}

// ─── Process-wide entry point ──────────────────────────────────────────────

static HOST: OnceLock<Arc<dyn HostRuntime>> = OnceLock::new();
static STARTED: Once = Once::new();
static AGENT: Mutex<Option<Agent>> = Mutex::new(None);

/// Register the host runtime used by [`initialize`].
///
/// Returns `false` if one was already registered.
pub fn set_host_runtime(host: Arc<dyn HostRuntime>) -> bool {
    HOST.set(host).is_ok()
}

/// Agent entry point, called once by the host runtime at startup.
///
/// Later calls do nothing.
pub fn initialize() {
    STARTED.call_once(|| match try_initialize() {
        Ok(agent) => *AGENT.lock().unwrap_or_else(PoisonError::into_inner) = agent,
        Err(e) => log::warn!("[Agent] Not starting: {e:#}"),
    });
}

/// Stop the agent started by [`initialize`], if any.
pub fn shutdown() {
    let agent = AGENT.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(agent) = agent {
        agent.shutdown();
    }
}

fn try_initialize() -> Result<Option<Agent>> {
    let config = AgentConfig::from_env();
    init_logging(matches!(&config, Ok(Some(c)) if c.verbose));

    let config = match config {
        Ok(Some(config)) => config,
        Ok(None) => {
            log::debug!("[Agent] No pipe configured; hot reload disabled");
            return Ok(None);
        }
        Err(e) => {
            // The pipe is set but unusable; children must not inherit it.
            let target = std::env::var(ENV_TARGET_PROCESS_PATH).unwrap_or_default();
            if config::is_current_executable(&target) {
                AgentConfig::clear_env();
            }
            return Err(e);
        }
    };

    if !config.is_target_process() {
        log::debug!(
            "[Agent] Not the target process (expected '{}')",
            config.target_process_path
        );
        return Ok(None);
    }

    AgentConfig::clear_env();

    let host = HOST
        .get()
        .cloned()
        .context("No host runtime registered")?;
    Ok(Agent::start(&config, host))
}

/// Install `env_logger` unless the host already set up a logger.
fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
