//! Session engine for the courier client.
//!
//! This crate holds the state machine that drives one protocol session
//! over one transport: the `initialize` handshake with version and
//! capability negotiation, correlation of in-flight requests to their
//! responses, routing of progress notifications, bounded retry of
//! idempotent operations, and cancellation/teardown that fails every
//! pending call instead of leaving it hanging.
//!
//! ```no_run
//! use courier_session::{Session, SessionConfig};
//! use courier_transport::stdio::{StdioServerConfig, StdioTransport};
//!
//! # async fn run() -> courier_core::CourierResult<()> {
//! let transport = StdioTransport::spawn(&StdioServerConfig::new("my-server"))?;
//! let session = Session::open(transport, SessionConfig::default());
//! session.initialize().await?;
//! let tools = session.list_tools().await?;
//! println!("{} tools", tools.len());
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod correlation;
pub mod progress;
pub mod retry;
pub mod session;

pub use correlation::{CorrelationTable, PendingCall};
pub use progress::{ProgressCallback, ProgressEvent, ProgressRouter};
pub use retry::RetryPolicy;
pub use session::{CallOptions, Session, SessionConfig, SessionState};
