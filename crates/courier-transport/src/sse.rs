//! Persistent event-stream transport: the server pushes messages over a
//! long-lived SSE connection while the client posts its own messages to
//! a companion endpoint.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_core::TransportError;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Transport, TransportResult};

/// Incremental decoder for `text/event-stream` bodies.
///
/// Only `data:` lines matter; each blank-line-delimited event becomes one
/// message, with multiple `data:` lines joined by newlines. Comments and
/// unknown fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of the stream, returning every event it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines.push(rest.trim_start().to_string());
            }
        }

        events
    }

    /// Flushes a trailing event that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_lines).join("\n"))
        }
    }
}

/// Options for connecting an [`SseTransport`].
#[derive(Debug, Clone)]
pub struct SseTransportOptions {
    /// Endpoint serving the long-lived event stream (GET).
    pub stream_endpoint: Url,
    /// Endpoint accepting client messages (POST).
    pub post_endpoint: Url,
}

/// Transport over a persistent server-sent-events stream.
pub struct SseTransport {
    http: reqwest::Client,
    post_endpoint: Url,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportResult<Vec<u8>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SseTransport {
    /// Opens the event stream and starts decoding it in the background.
    pub async fn connect(options: SseTransportOptions) -> TransportResult<Self> {
        let http = reqwest::Client::new();
        let response = http
            .get(options.stream_endpoint.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for event in decoder.feed(&String::from_utf8_lossy(&bytes)) {
                            if tx.send(Ok(event.into_bytes())).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(map_reqwest_error(e)));
                        return;
                    }
                }
            }
            if let Some(event) = decoder.finish() {
                let _ = tx.send(Ok(event.into_bytes()));
            }
            debug!("event stream ended");
        });

        Ok(Self {
            http,
            post_endpoint: options.post_endpoint,
            inbound: tokio::sync::Mutex::new(rx),
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let response = self
            .http
            .post(self.post_endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(frame)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Option<Vec<u8>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match self.inbound.lock().await.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => {
                warn!(error = %e, "event stream failed");
                Err(e)
            }
            None => Ok(None),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        debug!("sse transport closed");
        Ok(())
    }
}

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Http(e.to_string())
    }
}
