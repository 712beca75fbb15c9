//! Frame codec for the agent pipe.
//!
//! Length-prefixed frames with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! The length counts the type byte, so a zero length is invalid. The type
//! byte is opaque at this layer; [`crate::protocol`] assigns meaning to it.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{AgentError, AgentResult};

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Type tag selecting how the payload is decoded.
    pub frame_type: u8,
    /// Raw payload bytes (without the type tag).
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame from a tag and payload.
    pub fn new(frame_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Encode this frame into a wire-format byte vector.
    ///
    /// Returns `[u32 LE length][u8 type][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        encode_raw(self.frame_type, &self.payload)
    }
}

/// Encode a raw frame with type byte and payload.
pub fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for type byte
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    buf
}

/// Reads complete frames from the read half of the pipe.
///
/// Each call to [`read_frame`](Self::read_frame) suspends until a whole
/// frame has arrived. The length header is validated before any payload is
/// read, so an oversized frame is rejected without buffering it.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default size limit.
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_size(reader, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a reader that rejects frames longer than `max_frame_size`.
    pub fn with_max_frame_size(reader: R, max_frame_size: u32) -> Self {
        Self {
            reader,
            max_frame_size,
        }
    }

    /// Read the next frame.
    ///
    /// # Errors
    ///
    /// - [`AgentError::ConnectionClosed`] on EOF (`mid_frame` tells whether
    ///   any byte of the frame had been read)
    /// - [`AgentError::EmptyFrame`] / [`AgentError::FrameTooLarge`] on a bad
    ///   length header
    /// - [`AgentError::Io`] on other read failures
    pub async fn read_frame(&mut self) -> AgentResult<Frame> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                return Err(AgentError::ConnectionClosed {
                    mid_frame: filled > 0,
                });
            }
            filled += n;
        }

        let length = u32::from_le_bytes(header);
        if length == 0 {
            return Err(AgentError::EmptyFrame);
        }
        if length > self.max_frame_size {
            return Err(AgentError::FrameTooLarge {
                len: length,
                max: self.max_frame_size,
            });
        }

        let mut body = vec![0u8; length as usize];
        self.reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                AgentError::ConnectionClosed { mid_frame: true }
            } else {
                AgentError::Io(e)
            }
        })?;

        let mut payload = Bytes::from(body);
        let frame_type = payload[0];
        let payload = payload.split_off(1);
        Ok(Frame {
            frame_type,
            payload,
        })
    }

    /// Consume the reader and return the underlying stream half.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes frames to the write half of the pipe.
///
/// Writes take `&mut self`, so a single owner serializes them.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap the write half of a stream.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one frame and flush it.
    pub async fn write_frame(&mut self, frame_type: u8, payload: &[u8]) -> AgentResult<()> {
        let encoded = encode_raw(frame_type, payload);
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write half, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> AgentResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Consume the writer and return the underlying stream half.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
