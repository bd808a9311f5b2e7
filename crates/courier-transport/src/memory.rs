//! In-process duplex transport pair, for tests and same-process
//! embedding of a server.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_core::TransportError;
use tokio::sync::{mpsc, Mutex};

use crate::{Transport, TransportResult};

/// Creates a connected pair of in-memory transports. Frames sent on one
/// end arrive on the other, FIFO, with no backpressure.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport::new(left_tx, left_rx),
        MemoryTransport::new(right_tx, right_rx),
    )
}

/// One end of an in-memory duplex channel.
pub struct MemoryTransport {
    // Option so close() can drop the sender, which the peer observes as
    // a clean end of stream.
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> TransportResult<Option<Vec<u8>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().take();
        // Refuse further inbound sends from the peer as well.
        self.rx.lock().await.close();
        Ok(())
    }
}
