//! Wire envelope model and codec for the courier protocol.
//!
//! The envelope is JSON-RPC 2.0 shaped: presence of `id` and `method`
//! marks a request, `id` without `method` marks a response, `method`
//! without `id` marks a notification. [`codec`] turns envelopes into
//! bytes and back; framing (newlines, SSE events, HTTP bodies) belongs
//! to the transports.

pub mod codec;
pub mod envelope;

pub use envelope::{Envelope, Notification, ProgressToken, Request, RequestId, Response};
