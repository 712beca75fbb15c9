//! Connection session with the delta server.
//!
//! ```text
//! connect() ─► Initializing ─► DrainingInitialUpdates ─► SteadyStateReceiving ─► Closed
//!     │              │                   │                        │
//!     ▼              └───────────────────┴────────────────────────┴──► Closed
//!   None
//! ```
//!
//! Connecting is [`Session::connect`] itself: a session only exists once the
//! channel is open, and no server within the timeout yields `None`.
//!
//! The session owns the channel. After sending capabilities it drains the
//! updates that were queued before the process started; the caller blocks
//! on that phase so no stale code runs. The steady-state loop then handles
//! updates until the server disconnects or the session is cancelled.
//!
//! Every update request gets exactly one [`UpdateResponse`] before the next
//! frame is read. Engine work runs on the blocking pool so handler code never
//! runs on a reactor thread.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::engine::host::ModuleLoadSubscription;
use crate::engine::DeltaEngine;
use crate::error::{AgentError, AgentResult};
use crate::protocol::{
    ClientInitializationResponse, LogEntry, MessageSeverity, Request, Response, UpdateResponse,
};
use crate::transport::pipe::{self, PipeStream};
use crate::transport::{FrameReader, FrameWriter};

/// Lifecycle phase of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected; capabilities not sent yet.
    Initializing,
    /// Applying updates queued before startup; the process is blocked.
    DrainingInitialUpdates,
    /// Handling updates in the background.
    SteadyStateReceiving,
    /// Channel released. Terminal.
    Closed,
}

/// Outcome of handling one request.
enum Dispatched {
    Responded,
    InitialUpdatesCompleted,
}

/// One connection to the delta server.
pub struct Session<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
    engine: Arc<DeltaEngine>,
    subscription: Option<ModuleLoadSubscription>,
    state: SessionState,
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session<PipeStream> {
    /// Connect to the server listening on `pipe_name`.
    ///
    /// Returns `None` if no server answers within `timeout`; the process
    /// then runs without hot reload.
    pub async fn connect(
        pipe_name: &str,
        timeout: Duration,
        engine: Arc<DeltaEngine>,
    ) -> Option<Self> {
        log::debug!("[Session] Connecting");
        let stream = pipe::connect(pipe_name, timeout).await?;
        Some(Self::new(stream, engine))
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an already connected stream.
    pub fn new(stream: S, engine: Arc<DeltaEngine>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
            engine,
            subscription: None,
            state: SessionState::Initializing,
        }
    }

    /// Current phase.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Send capabilities and start observing module loads.
    ///
    /// # Errors
    ///
    /// Fails if the host cannot report its capabilities or they cannot be
    /// written; the session is closed.
    pub async fn initialize(&mut self) -> AgentResult<()> {
        self.expect_state(SessionState::Initializing)?;

        let engine = Arc::clone(&self.engine);
        let capabilities = match tokio::task::spawn_blocking(move || engine.capabilities()).await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                log::error!("[Session] Reading capabilities failed: {e}");
                self.close().await;
                return Err(AgentError::Host(e.to_string()));
            }
        };
        log::debug!("[Session] Capabilities: {capabilities}");

        let response = Response::Initialization(ClientInitializationResponse { capabilities });
        if let Err(e) = self.send(&response).await {
            self.close().await;
            return Err(e);
        }

        self.subscription = Some(self.engine.observe_module_loads());
        self.state = SessionState::DrainingInitialUpdates;
        Ok(())
    }

    /// Apply updates until the server marks the initial batch complete.
    ///
    /// # Errors
    ///
    /// Any transport failure, protocol violation or disconnect closes the
    /// session and is returned.
    pub async fn drain_initial_updates(&mut self) -> AgentResult<()> {
        self.expect_state(SessionState::DrainingInitialUpdates)?;

        loop {
            let result = match self.reader.read_frame().await {
                Ok(frame) => self.dispatch(frame).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(Dispatched::InitialUpdatesCompleted) => break,
                Ok(Dispatched::Responded) => {}
                Err(e) => {
                    log::warn!("[Session] Initial updates failed: {e}");
                    self.close().await;
                    return Err(e);
                }
            }
        }

        log::debug!("[Session] Initial updates applied");
        self.state = SessionState::SteadyStateReceiving;
        Ok(())
    }

    /// Handle updates until disconnect, failure or cancellation, then close.
    ///
    /// A graceful disconnect and cancellation both return `Ok`.
    ///
    /// # Errors
    ///
    /// Returns transport failures and protocol violations.
    pub async fn run(mut self, cancel: CancellationToken) -> AgentResult<()> {
        if let Err(e) = self.expect_state(SessionState::SteadyStateReceiving) {
            self.close().await;
            return Err(e);
        }

        let result = loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    log::debug!("[Session] Cancelled");
                    break Ok(());
                }
                frame = self.reader.read_frame() => frame,
            };

            let result = match frame {
                Ok(frame) => self.dispatch(frame).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(Dispatched::Responded) => {}
                Ok(Dispatched::InitialUpdatesCompleted) => {
                    log::debug!("[Session] Ignoring repeated initial-updates marker");
                }
                Err(e) if e.is_disconnect() => {
                    log::info!("[Session] Delta server disconnected");
                    break Ok(());
                }
                Err(e) => {
                    log::warn!("[Session] Closing after error: {e}");
                    break Err(e);
                }
            }
        };

        self.close().await;
        result
    }

    /// Release the channel and detach the module-load hook.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Err(e) = self.writer.shutdown().await {
            log::trace!("[Session] Shutdown error: {e}");
        }
        self.subscription = None;
        self.state = SessionState::Closed;
        log::debug!("[Session] Closed");
    }

    async fn dispatch(&mut self, frame: crate::transport::Frame) -> AgentResult<Dispatched> {
        let request = Request::from_frame(&frame)?;
        let engine = Arc::clone(&self.engine);

        let response = match request {
            Request::InitialUpdatesCompleted => return Ok(Dispatched::InitialUpdatesCompleted),
            Request::ManagedCodeUpdate(req) => {
                log::debug!("[Session] Managed code update: {} delta(s)", req.deltas.len());
                tokio::task::spawn_blocking(move || {
                    engine.apply_managed_code_updates(&req.deltas, req.response_logging_level)
                })
                .await
            }
            Request::StaticAssetUpdate(req) => {
                log::debug!("[Session] Static asset update: {}", req.update.relative_path);
                tokio::task::spawn_blocking(move || {
                    engine.apply_static_asset_update(&req.update, req.response_logging_level)
                })
                .await
            }
        };

        let response = response.unwrap_or_else(|e| {
            log::error!("[Session] Update task failed: {e}");
            UpdateResponse {
                success: false,
                log_entries: vec![LogEntry::new(
                    MessageSeverity::Error,
                    format!("Agent failed to apply the update: {e}"),
                )],
            }
        });

        self.send(&Response::Update(response)).await?;
        Ok(Dispatched::Responded)
    }

    async fn send(&mut self, response: &Response) -> AgentResult<()> {
        let frame = response.to_frame();
        self.writer.write_frame(frame.frame_type, &frame.payload).await
    }

    fn expect_state(&self, expected: SessionState) -> AgentResult<()> {
        if self.state != expected {
            return Err(AgentError::InvalidState {
                expected: format!("{expected:?}"),
                actual: format!("{:?}", self.state),
            });
        }
        Ok(())
    }
}
