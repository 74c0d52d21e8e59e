//! The frame carrier a session runs over.
//!
//! WebSocket implementations live with their socket types (the client SDK
//! adapts tokio-tungstenite, the server adapts axum's socket); the in-memory
//! pair here backs unit tests and loopback wiring.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// An ordered, reliable carrier of binary frames.
///
/// `recv` returning `Ok(None)` means the peer closed cleanly; an `Err` is a
/// carrier failure.  Implementations are driven by a single session task,
/// so `&mut self` suffices.
#[async_trait]
pub trait FrameTransport: Send + 'static {
    async fn send(&mut self, frame: Bytes) -> std::io::Result<()>;
    async fn recv(&mut self) -> std::io::Result<Option<Bytes>>;
    async fn close(&mut self) -> std::io::Result<()>;
}

/// In-memory transport half, connected to its twin from [`memory_pair`].
pub struct MemoryTransport {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
}

/// Build a connected pair of in-memory transports.
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        MemoryTransport {
            tx: Some(a_tx),
            rx: b_rx,
        },
        MemoryTransport {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn send(&mut self, frame: Bytes) -> std::io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))?;
        tx.send(frame)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed"))
    }

    async fn recv(&mut self) -> std::io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> std::io::Result<()> {
        // Dropping the sender is the clean-close signal: the twin's recv
        // drains any queued frames, then yields None.
        self.tx = None;
        Ok(())
    }
}
