//! Request/response HTTP transport: each outbound frame is a full POST
//! roundtrip, and response bodies are queued for the receive side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{TransportError, LATEST_PROTOCOL_VERSION};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio::sync::mpsc;
use tracing::debug;

use crate::sse::{map_reqwest_error, SseDecoder};
use crate::{Transport, TransportResult};

/// Options for building an [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportOptions {
    /// Endpoint every message is POSTed to.
    pub endpoint: Url,
    /// Per-roundtrip timeout.
    pub timeout: Duration,
    /// Protocol version advertised in the `mcp-protocol-version` header.
    pub protocol_version: String,
}

impl HttpTransportOptions {
    /// Options with a 30 second timeout and the latest protocol version.
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            timeout: Duration::from_secs(30),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Transport over plain request/response HTTP.
///
/// The server correlates roundtrips to one logical session via the
/// `mcp-session-id` header: the first response assigns it and every
/// later request carries it back.
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: Url,
    protocol_version: String,
    session_id: Mutex<Option<String>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Builds the transport. No connection is made until the first send.
    pub fn new(options: HttpTransportOptions) -> TransportResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            http,
            endpoint: options.endpoint,
            protocol_version: options.protocol_version,
            session_id: Mutex::new(None),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }

    /// The session id assigned by the server, once known.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn queue_inbound(&self, frame: Vec<u8>) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .header("mcp-protocol-version", &self.protocol_version)
            .body(frame);
        if let Some(sid) = self.session_id.lock().as_deref() {
            request = request.header("mcp-session-id", sid);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();

        if let Some(sid) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|h| h.to_str().ok())
        {
            *self.session_id.lock() = Some(sid.to_string());
        }

        // 202 acknowledges a notification; there is no body to queue.
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        if body.is_empty() {
            return Ok(());
        }

        if content_type.starts_with("text/event-stream") {
            let mut decoder = SseDecoder::new();
            let text = String::from_utf8_lossy(&body);
            for event in decoder.feed(&text) {
                self.queue_inbound(event.into_bytes());
            }
            if let Some(event) = decoder.finish() {
                self.queue_inbound(event.into_bytes());
            }
        } else {
            self.queue_inbound(body.to_vec());
        }
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Option<Vec<u8>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inbound_tx.lock().take();
        self.inbound_rx.lock().await.close();
        debug!("http transport closed");
        Ok(())
    }
}
