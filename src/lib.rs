//! Reload Agent - in-process hot reload delta application.
//!
//! This crate is loaded into a running process and keeps it in sync with a
//! delta server: compiled code deltas are patched into loaded modules and
//! static asset changes are pushed to content handlers, without restarting
//! the process.
//!
//! # Architecture
//!
//! ```text
//! Delta server                            Target process
//! ┌──────────────┐   frames over a    ┌──────────────────────────────┐
//! │ dev tooling  │◄──────────────────►│ Session ──► DeltaEngine      │
//! │ (listener)   │   local pipe       │                 │            │
//! └──────────────┘                    │                 ▼            │
//!                                     │            HostRuntime       │
//!                                     │  (modules, patcher, handlers)│
//!                                     └──────────────────────────────┘
//! ```
//!
//! - [`transport`] - length-prefixed, type-tagged frames over the pipe
//! - [`protocol`] - request/response message encodings
//! - [`session`] - connection state machine and request dispatch
//! - [`engine`] - delta application, handler discovery and ordering
//! - [`bootstrap`] - process entry point wiring everything together
//! - [`config`] - environment-supplied configuration

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use bootstrap::Agent;
pub use config::AgentConfig;
pub use engine::host::{HostRuntime, LoadedModule};
pub use engine::DeltaEngine;
pub use error::{AgentError, AgentResult};
pub use protocol::ModuleId;
pub use session::{Session, SessionState};
