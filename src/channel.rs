//! Bounded message queues
//!
//! Two of these connect the frame loops to the application handler: the
//! inbound queue carries decoded payloads toward the handler, the outbound
//! queue carries payloads the handler wants sent. Producers suspend while a
//! queue is full — this is the backpressure mechanism. Dropping either end
//! closes the queue and wakes whoever is blocked on the other.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Create a bounded payload queue with the given capacity.
pub(crate) fn message_channel(capacity: usize) -> (MessageWriter, MessageReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (MessageWriter { tx }, MessageReader { rx })
}

/// Consumer end of a bounded payload queue.
pub struct MessageReader {
    rx: mpsc::Receiver<Bytes>,
}

impl MessageReader {
    /// Receive the next payload.
    ///
    /// Suspends while the queue is empty. Returns `None` once the queue has
    /// been closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Producer end of a bounded payload queue.
#[derive(Clone)]
pub struct MessageWriter {
    tx: mpsc::Sender<Bytes>,
}

impl MessageWriter {
    /// Send a payload.
    ///
    /// Suspends while the queue is full. Fails with
    /// [`Error::ConnectionClosed`] once the consumer end is gone.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(payload.into())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}
