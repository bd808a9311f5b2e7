//! Core types and error definitions for the courier client.
//!
//! This crate provides the foundation shared across all courier crates:
//! the error taxonomy every public operation resolves to, and the
//! protocol payload types exchanged with a server (peer identity,
//! capability sets, tool/resource/prompt descriptors and results).
//!
//! # Main types
//!
//! - [`CourierError`] — Unified error enum for all courier subsystems.
//! - [`CourierResult`] — Convenience alias for `Result<T, CourierError>`.
//! - [`TransportError`] — Typed transport failures with a transient/fatal
//!   classification used by the retry policy.
//! - [`ServerCapabilities`] — The capability set negotiated during the
//!   handshake, immutable for the session's lifetime.

pub mod error;
pub mod types;

pub use error::{CourierError, CourierResult, ErrorObject, TransportError};
pub use types::{
    CallToolResult, ClientInfo, ContentBlock, GetPromptResult, InitializeResult, PromptArgument,
    PromptDescriptor, PromptMessage, ResourceContent, ResourceContents, ResourceDescriptor, Role,
    ServerCapabilities, ServerInfo, ToolDescriptor, LATEST_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
