//! Transport collaborator seam
//!
//! A session needs three things from its connection: a way to write one text
//! frame, a stream of inbound text frames, and an end-of-stream signal when
//! the connection goes away. The WebSocket adapter in [`crate::ws`] and the
//! in-memory pair below both provide them.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Write half of a connection; owned by the session's writer task
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection gracefully
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection; owned by the session's reader task
#[async_trait]
pub trait FrameStream: Send + 'static {
    /// Next inbound frame, or `None` once the connection is closed
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
}

impl TransportError {
    /// Whether the connection is unusable after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::InvalidUtf8)
    }
}

/// Sink end of an in-memory connection
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

/// Stream end of an in-memory connection
pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<String>,
}

/// The remote side of an in-memory connection
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Create a connected in-memory transport
///
/// The sink and stream go to a session; the peer plays the other side.
pub fn memory_pair() -> (MemorySink, MemoryStream, MemoryPeer) {
    let (to_peer, from_local) = mpsc::unbounded_channel();
    let (to_local, from_peer) = mpsc::unbounded_channel();

    (
        MemorySink { tx: Some(to_peer) },
        MemoryStream { rx: from_peer },
        MemoryPeer {
            tx: Some(to_local),
            rx: from_local,
        },
    )
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

impl MemoryPeer {
    /// Deliver a frame to the local side
    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text.into()).map_err(|_| TransportError::Closed)
    }

    /// Next frame written by the local side; `None` once it closed its sink
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Hang up: the local stream reports end of connection
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}
