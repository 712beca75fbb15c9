//! Agent protocol message types and payload encoding.
//!
//! Every message travels in one frame (see [`crate::transport::framing`]);
//! the frame's type byte selects the message kind and the payload carries
//! the fields below. All integers are little-endian.
//!
//! Requests (server → agent):
//! - `0x01` `ManagedCodeUpdate`: `[u32 count]` then per delta
//!   `[16-byte module id][bytes metadata][bytes il][bytes pdb][u32 n][i32 × n updated types]`,
//!   then `[u8 response logging level]`
//! - `0x02` `StaticAssetUpdate`: `[string assembly][string relative path]
//!   [bytes content | u32::MAX deletion sentinel][u8 is application project]
//!   [u8 response logging level]`
//! - `0x03` `InitialUpdatesCompleted`: empty payload
//!
//! Responses (agent → server):
//! - `0x01` `InitializationResponse`: `[string capabilities]`
//! - `0x02` `UpdateResponse`: `[u8 success][u32 count]` then per entry
//!   `[u8 severity][string message]`
//!
//! `bytes` and `string` are `[u32 length][raw bytes]`; strings are UTF-8.
//! Unknown tags and malformed payloads are protocol violations.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

use crate::error::{AgentError, AgentResult};
use crate::transport::Frame;

// ─── Type tags ─────────────────────────────────────────────────────────────

/// Frame type bytes for server → agent requests.
pub mod request_type {
    /// Batch of compiled code deltas.
    pub const MANAGED_CODE_UPDATE: u8 = 0x01;
    /// Single static asset change.
    pub const STATIC_ASSET_UPDATE: u8 = 0x02;
    /// Marker ending the initial (pre-startup) batch; no payload, no reply.
    pub const INITIAL_UPDATES_COMPLETED: u8 = 0x03;
}

/// Frame type bytes for agent → server responses.
pub mod response_type {
    /// Capability announcement, sent once after connecting.
    pub const INITIALIZATION_RESPONSE: u8 = 0x01;
    /// Result of one update request.
    pub const UPDATE_RESPONSE: u8 = 0x02;
}

/// Value of a content length that marks the asset as deleted.
const DELETION_SENTINEL: u32 = u32::MAX;

// ─── Data model ────────────────────────────────────────────────────────────

/// 128-bit version id of a loaded module.
///
/// Encoded on the wire in the little-endian GUID layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub Uuid);

impl ModuleId {
    /// Build from the 16 wire bytes.
    pub fn from_wire(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes_le(bytes))
    }

    /// The 16 wire bytes.
    pub fn to_wire(self) -> [u8; 16] {
        self.0.to_bytes_le()
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ModuleId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// One compiled change to a single module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDelta {
    /// Module the delta applies to.
    pub module_id: ModuleId,
    /// Metadata delta bytes.
    pub metadata_delta: Vec<u8>,
    /// IL delta bytes.
    pub il_delta: Vec<u8>,
    /// Debug symbol delta bytes (may be empty).
    pub pdb_delta: Vec<u8>,
    /// Metadata tokens of the types touched by this delta.
    pub updated_types: Vec<i32>,
}

/// A changed or deleted static asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAssetUpdate {
    /// Name of the module that owns the asset.
    pub assembly_name: String,
    /// Asset path relative to the project's web root.
    pub relative_path: String,
    /// New contents, or `None` if the asset was deleted.
    pub contents: Option<Vec<u8>>,
    /// Whether the asset belongs to the application project itself.
    pub is_application_project: bool,
}

/// How much of the agent log the server wants back in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ResponseLoggingLevel {
    /// Only warnings and errors.
    #[default]
    WarningsAndErrors = 0,
    /// Everything, including verbose progress messages.
    Verbose = 1,
}

impl TryFrom<u8> for ResponseLoggingLevel {
    type Error = AgentError;

    fn try_from(value: u8) -> AgentResult<Self> {
        match value {
            0 => Ok(Self::WarningsAndErrors),
            1 => Ok(Self::Verbose),
            other => Err(AgentError::malformed(format!(
                "unknown response logging level: {other}"
            ))),
        }
    }
}

/// Severity of an agent log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageSeverity {
    /// Progress detail.
    Verbose = 0,
    /// Something went wrong but the update continued.
    Warning = 1,
    /// The update failed.
    Error = 2,
}

impl TryFrom<u8> for MessageSeverity {
    type Error = AgentError;

    fn try_from(value: u8) -> AgentResult<Self> {
        match value {
            0 => Ok(MessageSeverity::Verbose),
            1 => Ok(MessageSeverity::Warning),
            2 => Ok(MessageSeverity::Error),
            other => Err(AgentError::malformed(format!("unknown severity: {other}"))),
        }
    }
}

/// One log line returned to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Entry severity.
    pub severity: MessageSeverity,
    /// Human-readable message.
    pub message: String,
}

impl LogEntry {
    /// Create an entry.
    pub fn new(severity: MessageSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

// ─── Messages ──────────────────────────────────────────────────────────────

/// Batch of code deltas to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedCodeUpdateRequest {
    /// Deltas in application order.
    pub deltas: Vec<UpdateDelta>,
    /// Verbosity of the reply's log entries.
    pub response_logging_level: ResponseLoggingLevel,
}

/// One static asset change to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAssetUpdateRequest {
    /// The asset change.
    pub update: StaticAssetUpdate,
    /// Verbosity of the reply's log entries.
    pub response_logging_level: ResponseLoggingLevel,
}

/// Agent's reply to an update request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateResponse {
    /// Whether the update was applied.
    pub success: bool,
    /// Log entries collected while applying.
    pub log_entries: Vec<LogEntry>,
}

/// Capability announcement sent once after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInitializationResponse {
    /// Space-separated capability names supported by this runtime.
    pub capabilities: String,
}

/// A decoded server → agent request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Apply code deltas.
    ManagedCodeUpdate(ManagedCodeUpdateRequest),
    /// Apply a static asset change.
    StaticAssetUpdate(StaticAssetUpdateRequest),
    /// All updates queued before process start have been sent.
    InitialUpdatesCompleted,
}

/// A decoded agent → server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Capability announcement.
    Initialization(ClientInitializationResponse),
    /// Result of an update request.
    Update(UpdateResponse),
}

impl Request {
    /// Frame type byte of this request.
    pub fn frame_type(&self) -> u8 {
        match self {
            Self::ManagedCodeUpdate(_) => request_type::MANAGED_CODE_UPDATE,
            Self::StaticAssetUpdate(_) => request_type::STATIC_ASSET_UPDATE,
            Self::InitialUpdatesCompleted => request_type::INITIAL_UPDATES_COMPLETED,
        }
    }

    /// Encode into a frame.
    pub fn to_frame(&self) -> Frame {
        let mut buf = Vec::new();
        match self {
            Self::ManagedCodeUpdate(req) => {
                buf.put_u32_le(req.deltas.len() as u32);
                for delta in &req.deltas {
                    buf.put_slice(&delta.module_id.to_wire());
                    put_bytes(&mut buf, &delta.metadata_delta);
                    put_bytes(&mut buf, &delta.il_delta);
                    put_bytes(&mut buf, &delta.pdb_delta);
                    buf.put_u32_le(delta.updated_types.len() as u32);
                    for token in &delta.updated_types {
                        buf.put_i32_le(*token);
                    }
                }
                buf.put_u8(req.response_logging_level as u8);
            }
            Self::StaticAssetUpdate(req) => {
                put_string(&mut buf, &req.update.assembly_name);
                put_string(&mut buf, &req.update.relative_path);
                match &req.update.contents {
                    Some(contents) => put_bytes(&mut buf, contents),
                    None => buf.put_u32_le(DELETION_SENTINEL),
                }
                buf.put_u8(u8::from(req.update.is_application_project));
                buf.put_u8(req.response_logging_level as u8);
            }
            Self::InitialUpdatesCompleted => {}
        }
        Frame::new(self.frame_type(), buf)
    }

    /// Decode a request frame.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::UnknownRequestType`] for an unrecognized tag and
    /// [`AgentError::Malformed`] if the payload does not match the tag.
    pub fn from_frame(frame: &Frame) -> AgentResult<Self> {
        let mut reader = PayloadReader::new(frame.payload.clone());
        let request = match frame.frame_type {
            request_type::MANAGED_CODE_UPDATE => {
                let count = reader.u32("delta count")? as usize;
                // Each delta needs at least 32 bytes; bound the allocation.
                let mut deltas = Vec::with_capacity(count.min(reader.remaining() / 32));
                for _ in 0..count {
                    let module_id = reader.module_id()?;
                    let metadata_delta = reader.bytes("metadata delta")?;
                    let il_delta = reader.bytes("IL delta")?;
                    let pdb_delta = reader.bytes("PDB delta")?;
                    let type_count = reader.u32("updated type count")? as usize;
                    if type_count > reader.remaining() / 4 {
                        return Err(AgentError::malformed(format!(
                            "updated type count {type_count} exceeds payload"
                        )));
                    }
                    let mut updated_types = Vec::with_capacity(type_count);
                    for _ in 0..type_count {
                        updated_types.push(reader.i32("updated type")?);
                    }
                    deltas.push(UpdateDelta {
                        module_id,
                        metadata_delta,
                        il_delta,
                        pdb_delta,
                        updated_types,
                    });
                }
                let response_logging_level = reader.logging_level()?;
                Self::ManagedCodeUpdate(ManagedCodeUpdateRequest {
                    deltas,
                    response_logging_level,
                })
            }
            request_type::STATIC_ASSET_UPDATE => {
                let assembly_name = reader.string("assembly name")?;
                let relative_path = reader.string("relative path")?;
                let contents = reader.optional_bytes("content")?;
                let is_application_project = reader.bool("is application project")?;
                let response_logging_level = reader.logging_level()?;
                Self::StaticAssetUpdate(StaticAssetUpdateRequest {
                    update: StaticAssetUpdate {
                        assembly_name,
                        relative_path,
                        contents,
                        is_application_project,
                    },
                    response_logging_level,
                })
            }
            request_type::INITIAL_UPDATES_COMPLETED => Self::InitialUpdatesCompleted,
            other => return Err(AgentError::UnknownRequestType(other)),
        };
        reader.finish()?;
        Ok(request)
    }
}

impl Response {
    /// Frame type byte of this response.
    pub fn frame_type(&self) -> u8 {
        match self {
            Self::Initialization(_) => response_type::INITIALIZATION_RESPONSE,
            Self::Update(_) => response_type::UPDATE_RESPONSE,
        }
    }

    /// Encode into a frame.
    pub fn to_frame(&self) -> Frame {
        let mut buf = Vec::new();
        match self {
            Self::Initialization(init) => put_string(&mut buf, &init.capabilities),
            Self::Update(resp) => {
                buf.put_u8(u8::from(resp.success));
                buf.put_u32_le(resp.log_entries.len() as u32);
                for entry in &resp.log_entries {
                    buf.put_u8(entry.severity as u8);
                    put_string(&mut buf, &entry.message);
                }
            }
        }
        Frame::new(self.frame_type(), buf)
    }

    /// Decode a response frame.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::UnknownResponseType`] for an unrecognized tag and
    /// [`AgentError::Malformed`] if the payload does not match the tag.
    pub fn from_frame(frame: &Frame) -> AgentResult<Self> {
        let mut reader = PayloadReader::new(frame.payload.clone());
        let response = match frame.frame_type {
            response_type::INITIALIZATION_RESPONSE => {
                Self::Initialization(ClientInitializationResponse {
                    capabilities: reader.string("capabilities")?,
                })
            }
            response_type::UPDATE_RESPONSE => {
                let success = reader.bool("success")?;
                let count = reader.u32("log entry count")? as usize;
                // Each entry needs at least 5 bytes; bound the allocation.
                let mut log_entries = Vec::with_capacity(count.min(reader.remaining() / 5));
                for _ in 0..count {
                    let severity = MessageSeverity::try_from(reader.u8("severity")?)?;
                    let message = reader.string("log message")?;
                    log_entries.push(LogEntry { severity, message });
                }
                Self::Update(UpdateResponse {
                    success,
                    log_entries,
                })
            }
            other => return Err(AgentError::UnknownResponseType(other)),
        };
        reader.finish()?;
        Ok(response)
    }
}

// ─── Payload helpers ───────────────────────────────────────────────────────

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Bounds-checked cursor over a frame payload.
///
/// `Buf` accessors panic on short input; every read here checks first and
/// reports which field was truncated.
struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> AgentResult<()> {
        if self.buf.remaining() < n {
            return Err(AgentError::malformed(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> AgentResult<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, what: &str) -> AgentResult<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn i32(&mut self, what: &str) -> AgentResult<i32> {
        self.need(4, what)?;
        Ok(self.buf.get_i32_le())
    }

    fn bool(&mut self, what: &str) -> AgentResult<bool> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(AgentError::malformed(format!("invalid {what} flag: {other}"))),
        }
    }

    fn logging_level(&mut self) -> AgentResult<ResponseLoggingLevel> {
        ResponseLoggingLevel::try_from(self.u8("response logging level")?)
    }

    fn module_id(&mut self) -> AgentResult<ModuleId> {
        self.need(16, "module id")?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(ModuleId::from_wire(raw))
    }

    fn take(&mut self, len: usize, what: &str) -> AgentResult<Vec<u8>> {
        self.need(len, what)?;
        Ok(self.buf.split_to(len).to_vec())
    }

    fn bytes(&mut self, what: &str) -> AgentResult<Vec<u8>> {
        let len = self.u32(what)? as usize;
        self.take(len, what)
    }

    fn optional_bytes(&mut self, what: &str) -> AgentResult<Option<Vec<u8>>> {
        let len = self.u32(what)?;
        if len == DELETION_SENTINEL {
            return Ok(None);
        }
        self.take(len as usize, what).map(Some)
    }

    fn string(&mut self, what: &str) -> AgentResult<String> {
        let raw = self.bytes(what)?;
        String::from_utf8(raw).map_err(|e| AgentError::malformed(format!("{what} is not UTF-8: {e}")))
    }

    fn finish(&self) -> AgentResult<()> {
        if self.buf.has_remaining() {
            return Err(AgentError::malformed(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────
