//! Transport implementations for the courier session engine.
//!
//! A [`Transport`] is a connected duplex channel carrying opaque message
//! frames. The session engine owns exactly one transport for its
//! lifetime and assumes nothing beyond what the trait documents: frames
//! are delivered FIFO per direction on stream and pipe transports, and a
//! transport that errors or closes stays down (reconnecting means
//! building a new transport and a new session).
//!
//! Provided variants:
//!
//! - [`stdio::StdioTransport`] — newline-delimited messages over the
//!   stdin/stdout of a child process.
//! - [`http::HttpTransport`] — request/response HTTP; each send is a
//!   full roundtrip and the response body is queued for `recv`.
//! - [`sse::SseTransport`] — persistent event stream; the server pushes
//!   messages over a long-lived connection, the client posts separately.
//! - [`memory::pair`] — an in-process duplex pair for tests and
//!   embedding.

pub mod http;
pub mod memory;
pub mod sse;
pub mod stdio;

use async_trait::async_trait;
use courier_core::TransportError;

/// A convenience `Result` alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A connected duplex channel carrying opaque message frames.
///
/// Methods take `&self` so one dispatch task can sit in [`recv`] while
/// other tasks [`send`] through the same shared handle. Only one task
/// should call `recv` at a time; concurrent receivers would race for
/// frames.
///
/// [`recv`]: Transport::recv
/// [`send`]: Transport::send
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Transmits one message frame to the peer.
    async fn send(&self, frame: Vec<u8>) -> TransportResult<()>;

    /// Waits for the next inbound frame. Returns `Ok(None)` once the
    /// channel is cleanly closed and no further frames will arrive.
    async fn recv(&self) -> TransportResult<Option<Vec<u8>>>;

    /// Shuts the channel down. Idempotent; later calls are no-ops.
    async fn close(&self) -> TransportResult<()>;
}
