//! The session state machine: handshake, inbound dispatch, operations,
//! and lifecycle.
//!
//! One session owns one transport. A single dispatch task reads inbound
//! frames and routes them; caller tasks register a correlation slot,
//! transmit, and suspend on that slot until it resolves, is cancelled,
//! or the session goes down. The correlation table is the only shared
//! mutable structure on that path, so resolution and cancellation cannot
//! race.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::types::{ListPromptsResult, ListResourcesResult, ListToolsResult};
use courier_core::{
    CallToolResult, ClientInfo, CourierError, CourierResult, GetPromptResult, InitializeResult,
    PromptDescriptor, ResourceContents, ResourceDescriptor, ServerCapabilities, ServerInfo,
    ToolDescriptor, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use courier_transport::Transport;
use courier_wire::{codec, Envelope, ProgressToken, RequestId};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::correlation::CorrelationTable;
use crate::progress::{ProgressCallback, ProgressEvent, ProgressRouter};
use crate::retry::{with_retry, RetryPolicy};

const PROGRESS_METHOD: &str = "notifications/progress";
const CANCELLED_METHOD: &str = "notifications/cancelled";
const INITIALIZED_METHOD: &str = "notifications/initialized";

/// Configuration for one session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Identity presented during the handshake.
    #[serde(default)]
    pub client_info: ClientInfo,
    /// Default per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retry policy for idempotent operations.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_info: ClientInfo::default(),
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Connection state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No transport attached yet.
    Unconnected,
    /// Transport attached, handshake not yet completed.
    Initializing,
    /// Handshake done; operations are accepted.
    Ready,
    /// Close in progress.
    Closing,
    /// Closed; terminal.
    Closed,
    /// Unrecoverable transport error; terminal.
    Faulted(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconnected => write!(f, "unconnected"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Faulted(reason) => write!(f, "faulted: {reason}"),
        }
    }
}

/// Per-call options for [`Session::call_tool_with`].
#[derive(Default)]
pub struct CallOptions {
    /// Overrides the session's default request timeout.
    pub timeout: Option<Duration>,
    /// Cancels the call when triggered.
    pub cancel: Option<CancellationToken>,
    /// Receives progress events for this call.
    pub progress: Option<ProgressCallback>,
}

impl CallOptions {
    /// Empty options: session defaults, no cancellation, no progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a per-call timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches a cancellation token to the call.
    #[must_use]
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Attaches a progress callback to the call. The callback runs on
    /// the dispatch task and must not block.
    #[must_use]
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressEvent) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }
}

#[derive(Default)]
struct RequestOptions {
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    progress_token: Option<ProgressToken>,
}

#[derive(Clone)]
struct Negotiated {
    protocol_version: String,
    capabilities: ServerCapabilities,
    server_info: Option<ServerInfo>,
}

#[derive(Clone, Copy)]
enum CapabilityKind {
    Tools,
    Resources,
    Prompts,
}

impl CapabilityKind {
    fn name(self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::Resources => "resources",
            Self::Prompts => "prompts",
        }
    }
}

type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

struct SessionShared {
    transport: Arc<dyn Transport>,
    state: RwLock<SessionState>,
    calls: CorrelationTable,
    progress: ProgressRouter,
    handlers: Mutex<HashMap<String, NotificationHandler>>,
    negotiated: RwLock<Option<Negotiated>>,
    config: SessionConfig,
    shutdown: CancellationToken,
    transport_closed: AtomicBool,
}

/// One protocol session over one transport.
///
/// The session takes ownership of an already-open transport and holds it
/// for its whole lifetime. Dropping the session cancels the dispatch
/// task, fails every pending call, and releases the transport.
pub struct Session {
    shared: Arc<SessionShared>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Takes ownership of an open transport and starts the inbound
    /// dispatch task. Must be called within a tokio runtime.
    ///
    /// The session starts out initializing; call [`initialize`] before
    /// anything else.
    ///
    /// [`initialize`]: Session::initialize
    pub fn open<T: Transport>(transport: T, config: SessionConfig) -> Self {
        let shared = Arc::new(SessionShared {
            transport: Arc::new(transport),
            state: RwLock::new(SessionState::Initializing),
            calls: CorrelationTable::new(),
            progress: ProgressRouter::new(),
            handlers: Mutex::new(HashMap::new()),
            negotiated: RwLock::new(None),
            config,
            shutdown: CancellationToken::new(),
            transport_closed: AtomicBool::new(false),
        });
        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&shared)));
        Self {
            shared,
            dispatch: Mutex::new(Some(dispatch)),
        }
    }

    /// Performs the `initialize` handshake.
    ///
    /// Offers the latest supported protocol version; the negotiated
    /// version is the minimum of offered and returned, and anything
    /// outside the supported range is a handshake error. On success the
    /// server's capability set is fixed for the session's lifetime and
    /// the session becomes ready.
    pub async fn initialize(&self) -> CourierResult<InitializeResult> {
        match &*self.shared.state.read() {
            SessionState::Unconnected | SessionState::Initializing => {}
            SessionState::Ready => {
                return Err(CourierError::Handshake("already initialized".into()))
            }
            state => return Err(CourierError::SessionClosed(state.to_string())),
        }

        let params = json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": self.shared.config.client_info,
        });
        let value = with_retry(&self.shared.config.retry, "initialize", || {
            self.request_raw("initialize", Some(params.clone()), RequestOptions::default())
        })
        .await?;
        let init: InitializeResult = serde_json::from_value(value)?;

        let version = negotiate_version(LATEST_PROTOCOL_VERSION, &init.protocol_version)?;
        *self.shared.negotiated.write() = Some(Negotiated {
            protocol_version: version.clone(),
            capabilities: init.capabilities.clone(),
            server_info: init.server_info.clone(),
        });

        // Complete the lifecycle handshake before accepting operations.
        self.send_notification(INITIALIZED_METHOD, None).await?;

        {
            let mut state = self.shared.state.write();
            match &*state {
                SessionState::Initializing | SessionState::Unconnected => {
                    *state = SessionState::Ready;
                }
                state => return Err(CourierError::SessionClosed(state.to_string())),
            }
        }
        info!(
            version = %version,
            server = init.server_info.as_ref().map_or("unknown", |s| s.name.as_str()),
            "session ready"
        );
        Ok(init)
    }

    /// Lists the tools the server exposes.
    pub async fn list_tools(&self) -> CourierResult<Vec<ToolDescriptor>> {
        self.ensure_ready()?;
        self.require_capability(CapabilityKind::Tools)?;
        let value = with_retry(&self.shared.config.retry, "tools/list", || {
            self.request_raw("tools/list", None, RequestOptions::default())
        })
        .await?;
        let result: ListToolsResult = serde_json::from_value(value)?;
        Ok(result.tools)
    }

    /// Invokes a tool and waits for its result.
    ///
    /// Never retried: tool execution may have side effects, and a
    /// transport failure after the send leaves the outcome unknown.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> CourierResult<CallToolResult> {
        self.call_tool_with(name, arguments, CallOptions::new()).await
    }

    /// Invokes a tool with a per-call timeout, cancellation token, or
    /// progress callback.
    pub async fn call_tool_with(
        &self,
        name: &str,
        arguments: Value,
        options: CallOptions,
    ) -> CourierResult<CallToolResult> {
        self.ensure_ready()?;
        self.require_capability(CapabilityKind::Tools)?;

        let mut params = json!({"name": name, "arguments": arguments});
        let mut request_options = RequestOptions {
            timeout: options.timeout,
            cancel: options.cancel,
            progress_token: None,
        };

        let token = options.progress.map(|callback| {
            let token = ProgressToken::String(Uuid::new_v4().to_string());
            params["_meta"] = json!({"progressToken": token.clone()});
            self.shared.progress.register(token.clone(), callback);
            request_options.progress_token = Some(token.clone());
            token
        });

        let outcome = self.request_raw("tools/call", Some(params), request_options).await;

        // The token's lifetime is the call's lifetime.
        if let Some(token) = token {
            self.shared.progress.unregister(&token);
        }

        Ok(serde_json::from_value(outcome?)?)
    }

    /// Lists the resources the server exposes.
    pub async fn list_resources(&self) -> CourierResult<Vec<ResourceDescriptor>> {
        self.ensure_ready()?;
        self.require_capability(CapabilityKind::Resources)?;
        let value = with_retry(&self.shared.config.retry, "resources/list", || {
            self.request_raw("resources/list", None, RequestOptions::default())
        })
        .await?;
        let result: ListResourcesResult = serde_json::from_value(value)?;
        Ok(result.resources)
    }

    /// Reads one resource by URI.
    pub async fn read_resource(&self, uri: &str) -> CourierResult<ResourceContents> {
        self.ensure_ready()?;
        self.require_capability(CapabilityKind::Resources)?;
        let value = with_retry(&self.shared.config.retry, "resources/read", || {
            self.request_raw("resources/read", Some(json!({"uri": uri})), RequestOptions::default())
        })
        .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Lists the prompts the server exposes.
    pub async fn list_prompts(&self) -> CourierResult<Vec<PromptDescriptor>> {
        self.ensure_ready()?;
        self.require_capability(CapabilityKind::Prompts)?;
        let value = with_retry(&self.shared.config.retry, "prompts/list", || {
            self.request_raw("prompts/list", None, RequestOptions::default())
        })
        .await?;
        let result: ListPromptsResult = serde_json::from_value(value)?;
        Ok(result.prompts)
    }

    /// Renders one prompt with the given arguments.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> CourierResult<GetPromptResult> {
        self.ensure_ready()?;
        self.require_capability(CapabilityKind::Prompts)?;
        let mut params = json!({"name": name});
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let value = with_retry(&self.shared.config.retry, "prompts/get", || {
            self.request_raw("prompts/get", Some(params.clone()), RequestOptions::default())
        })
        .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Registers a handler for a notification method, replacing any
    /// previous one. Handlers run on the dispatch task and must not
    /// block; notifications without a handler are dropped.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .lock()
            .insert(method.into(), Arc::new(handler));
    }

    /// Closes the session: fails every pending call, stops the dispatch
    /// task, and closes the transport exactly once. Idempotent.
    pub async fn close(&self) -> CourierResult<()> {
        {
            let mut state = self.shared.state.write();
            match &*state {
                SessionState::Closing | SessionState::Closed => return Ok(()),
                SessionState::Faulted(_) => {
                    // Teardown already ran on the fault path; just make
                    // sure the dispatch task is gone.
                    drop(state);
                    self.join_dispatch().await;
                    self.shared.close_transport().await;
                    return Ok(());
                }
                _ => *state = SessionState::Closing,
            }
        }

        let drained = self
            .shared
            .calls
            .drain_all(|| CourierError::SessionClosed("session closed".into()));
        if drained > 0 {
            debug!(drained, "failed outstanding calls on close");
        }
        self.shared.shutdown.cancel();
        self.join_dispatch().await;
        self.shared.close_transport().await;
        *self.shared.state.write() = SessionState::Closed;
        info!("session closed");
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        self.shared.state.read().clone()
    }

    /// The protocol version negotiated during the handshake.
    pub fn protocol_version(&self) -> Option<String> {
        self.shared
            .negotiated
            .read()
            .as_ref()
            .map(|n| n.protocol_version.clone())
    }

    /// The capability set the server advertised during the handshake.
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.shared
            .negotiated
            .read()
            .as_ref()
            .map(|n| n.capabilities.clone())
    }

    /// The server identity, when the server provided one.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared
            .negotiated
            .read()
            .as_ref()
            .and_then(|n| n.server_info.clone())
    }

    /// Number of calls currently awaiting a response.
    pub fn outstanding_calls(&self) -> usize {
        self.shared.calls.outstanding()
    }

    fn ensure_ready(&self) -> CourierResult<()> {
        match &*self.shared.state.read() {
            SessionState::Ready => Ok(()),
            SessionState::Unconnected | SessionState::Initializing => Err(
                CourierError::Handshake("session is not initialized".into()),
            ),
            SessionState::Closing | SessionState::Closed => {
                Err(CourierError::SessionClosed("session closed".into()))
            }
            SessionState::Faulted(reason) => Err(CourierError::SessionClosed(format!(
                "session faulted: {reason}"
            ))),
        }
    }

    fn require_capability(&self, kind: CapabilityKind) -> CourierResult<()> {
        let negotiated = self.shared.negotiated.read();
        let Some(negotiated) = negotiated.as_ref() else {
            return Err(CourierError::Handshake("session is not initialized".into()));
        };
        let advertised = match kind {
            CapabilityKind::Tools => negotiated.capabilities.tools.is_some(),
            CapabilityKind::Resources => negotiated.capabilities.resources.is_some(),
            CapabilityKind::Prompts => negotiated.capabilities.prompts.is_some(),
        };
        if advertised {
            Ok(())
        } else {
            Err(CourierError::Capability(format!(
                "server did not advertise {} support",
                kind.name()
            )))
        }
    }

    /// Registers a slot, transmits the request, and suspends until the
    /// slot resolves, the deadline passes, or the caller cancels.
    async fn request_raw(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> CourierResult<Value> {
        let call = self
            .shared
            .calls
            .register(method, options.progress_token.clone())?;
        let id = call.id.clone();

        let frame = codec::encode(&Envelope::request(id.clone(), method, params))?;
        if let Err(e) = self.shared.transport.send(frame).await {
            self.shared.calls.cancel(&id, "request transmission failed");
            return Err(e.into());
        }

        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.shared.config.request_timeout_ms));
        let cancel = options.cancel.unwrap_or_default();

        tokio::select! {
            outcome = call.wait() => outcome,
            () = tokio::time::sleep(timeout) => {
                self.cancel_call(&id, "request timed out").await;
                Err(CourierError::Cancelled(format!(
                    "request '{method}' timed out after {}ms",
                    timeout.as_millis()
                )))
            }
            () = cancel.cancelled() => {
                self.cancel_call(&id, "cancelled by caller").await;
                Err(CourierError::Cancelled(format!(
                    "request '{method}' cancelled by caller"
                )))
            }
        }
    }

    /// Removes the call and best-effort tells the server to stop working
    /// on it. The caller gets its cancellation error regardless of
    /// whether the server ever acknowledges.
    async fn cancel_call(&self, id: &RequestId, reason: &str) {
        if !self.shared.calls.cancel(id, reason) {
            return;
        }
        let params = json!({"requestId": id, "reason": reason});
        match codec::encode(&Envelope::notification(CANCELLED_METHOD, Some(params))) {
            Ok(frame) => {
                if let Err(e) = self.shared.transport.send(frame).await {
                    debug!(id = %id, error = %e, "could not send cancellation notification");
                }
            }
            Err(e) => debug!(error = %e, "could not encode cancellation notification"),
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> CourierResult<()> {
        let frame = codec::encode(&Envelope::notification(method, params))?;
        self.shared.transport.send(frame).await?;
        Ok(())
    }

    async fn join_dispatch(&self) {
        let handle = self.dispatch.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let drained = self
            .shared
            .calls
            .drain_all(|| CourierError::SessionClosed("session dropped".into()));
        if drained > 0 {
            warn!(drained, "session dropped with outstanding calls");
        }
        // The detached dispatch task observes the cancellation and
        // closes the transport on its way out.
        self.shared.shutdown.cancel();
        let mut state = self.shared.state.write();
        if !matches!(*state, SessionState::Faulted(_)) {
            *state = SessionState::Closed;
        }
    }
}

impl SessionShared {
    /// Escalates an unrecoverable transport error: terminal state, every
    /// pending call failed with the fault reason, dispatch stopped.
    fn fault(&self, reason: &str) {
        {
            let mut state = self.state.write();
            match &*state {
                SessionState::Closing | SessionState::Closed | SessionState::Faulted(_) => return,
                _ => *state = SessionState::Faulted(reason.to_string()),
            }
        }
        error!(reason, "session faulted");
        let drained = self
            .calls
            .drain_all(|| CourierError::SessionClosed(format!("session faulted: {reason}")));
        if drained > 0 {
            warn!(drained, "failed pending calls after fault");
        }
        self.shutdown.cancel();
    }

    async fn close_transport(&self) {
        if self.transport_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "transport close failed");
        }
    }

    /// Routes one inbound message. Faults scoped to a single message are
    /// contained here; they never take the session down.
    fn handle_frame(&self, bytes: &[u8]) {
        match codec::decode(bytes) {
            Ok(Envelope::Response(response)) => {
                let id = response.id.clone();
                let outcome = response
                    .into_result()
                    .map_err(CourierError::Application);
                if !self.calls.resolve(&id, outcome) {
                    debug!(id = %id, "dropping response for unknown or already resolved id");
                }
            }
            Ok(Envelope::Notification(n)) if n.method == PROGRESS_METHOD => {
                match serde_json::from_value::<ProgressEvent>(n.params.unwrap_or(Value::Null)) {
                    Ok(event) => {
                        self.progress.deliver(event);
                    }
                    Err(e) => debug!(error = %e, "dropping malformed progress notification"),
                }
            }
            Ok(Envelope::Notification(n)) => {
                let handler = self.handlers.lock().get(&n.method).cloned();
                match handler {
                    Some(handler) => {
                        let params = n.params.unwrap_or(Value::Null);
                        if catch_unwind(AssertUnwindSafe(|| handler(params))).is_err() {
                            warn!(method = %n.method, "notification handler panicked");
                        }
                    }
                    None => debug!(method = %n.method, "dropping unhandled notification"),
                }
            }
            Ok(Envelope::Request(request)) => {
                debug!(
                    id = %request.id,
                    method = %request.method,
                    "dropping server-initiated request"
                );
            }
            Err(e) => {
                warn!(error = %e, "dropping undecodable message");
            }
        }
    }
}

/// Reads the transport until shutdown, routing every inbound message.
/// Transport loss is fatal: the session faults rather than reconnecting.
async fn dispatch_loop(shared: Arc<SessionShared>) {
    loop {
        let frame = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            frame = shared.transport.recv() => frame,
        };
        match frame {
            Ok(Some(bytes)) => shared.handle_frame(&bytes),
            Ok(None) => {
                shared.fault("transport closed by peer");
                break;
            }
            Err(e) => {
                shared.fault(&format!("transport failure: {e}"));
                break;
            }
        }
    }
    shared.close_transport().await;
}

/// The negotiated version is the minimum of what was offered and what
/// the server returned; outside the supported set the handshake fails.
/// Version strings are dates, so lexicographic order is enough.
fn negotiate_version(offered: &str, server: &str) -> CourierResult<String> {
    let negotiated = if server < offered { server } else { offered };
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&negotiated) {
        Ok(negotiated.to_string())
    } else {
        Err(CourierError::Handshake(format!(
            "server protocol version '{server}' is outside the supported range \
             {SUPPORTED_PROTOCOL_VERSIONS:?}"
        )))
    }
}
