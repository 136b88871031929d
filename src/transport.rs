//! Raw channel abstraction.
//!
//! The core never frames bytes itself; it hands complete [`Envelope`]s to a
//! [`RawChannel`] and gets complete envelopes back. A byte-oriented channel
//! can serialize envelopes with serde; [`MemoryChannel`] delivers them
//! structurally and is the semantic reference implementation — any other
//! channel must behave identically.

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::wire::Envelope;

/// Errors surfaced by a raw channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer endpoint is gone; nothing can be delivered.
    #[error("raw channel closed")]
    Closed,
}

/// A raw two-party message channel.
///
/// The channel delivers discrete structured messages, in order per
/// direction, with no correlation, flow control, or error typing of its own.
/// Posting an envelope transfers ownership of any attached buffers.
///
/// Only the endpoint drive loop calls [`RawChannel::recv`]; everything else
/// posts.
pub trait RawChannel: Send + Sync + 'static {
    /// Post one message to the peer.
    fn post(&self, env: Envelope) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next inbound message, or `None` once the channel closed.
    fn recv(&self) -> impl Future<Output = Option<Envelope>> + Send;
}

/// In-process raw channel half, backed by a pair of mpsc queues.
pub struct MemoryChannel {
    tx: mpsc::Sender<Envelope>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
}

/// Create a connected pair of in-process channel halves.
///
/// `capacity` bounds each direction independently; a full queue exerts
/// backpressure on `post`.
pub fn memory_pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        MemoryChannel {
            tx: a_tx,
            rx: tokio::sync::Mutex::new(a_rx),
        },
        MemoryChannel {
            tx: b_tx,
            rx: tokio::sync::Mutex::new(b_rx),
        },
    )
}

impl RawChannel for MemoryChannel {
    async fn post(&self, env: Envelope) -> Result<(), TransportError> {
        self.tx.send(env).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }
}
