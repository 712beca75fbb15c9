//! Error types for the agent.
//!
//! Transport failures and protocol violations are kept apart so callers can
//! tell a dropped pipe from a server speaking a different protocol version.
//! Both end the session; neither ever reaches host code.

use thiserror::Error;

/// Result type used by the transport, protocol and session layers.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Errors raised while talking to the delta server.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Underlying pipe I/O failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed (mid_frame: {mid_frame})")]
    ConnectionClosed {
        /// True when EOF arrived after a frame had started.
        mid_frame: bool,
    },

    /// Frame length header exceeds the configured maximum.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared length.
        len: u32,
        /// Configured maximum.
        max: u32,
    },

    /// Frame length header of zero (no room for the type tag).
    #[error("invalid frame: zero length")]
    EmptyFrame,

    /// Tag byte does not name a known request.
    #[error("unknown request type: 0x{0:02x}")]
    UnknownRequestType(u8),

    /// Tag byte does not name a known response.
    #[error("unknown response type: 0x{0:02x}")]
    UnknownResponseType(u8),

    /// Payload could not be decoded.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The host runtime failed while the agent was calling into it.
    #[error("host runtime failed: {0}")]
    Host(String),

    /// A session phase was entered out of order.
    #[error("invalid session state: expected {expected}, was {actual}")]
    InvalidState {
        /// Phase the operation requires.
        expected: String,
        /// Phase the session was in.
        actual: String,
    },

    /// The operation was cancelled by shutdown.
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    /// Returns true for errors caused by the peer violating the wire protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::EmptyFrame
                | Self::UnknownRequestType(_)
                | Self::UnknownResponseType(_)
                | Self::Malformed(_)
        )
    }

    /// Returns true if the error is a clean disconnect at a frame boundary.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed { mid_frame: false })
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
