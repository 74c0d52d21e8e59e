//! Adapters between axum WebSockets and the tunnel abstractions: a frame
//! transport for mux sessions and a byte-stream view for the raw-TCP
//! front-end.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Mux frame carrier over an accepted upstream socket.
pub struct AxumWsTransport {
    inner: WebSocket,
}

impl AxumWsTransport {
    pub fn new(inner: WebSocket) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl piko_mux::FrameTransport for AxumWsTransport {
    async fn send(&mut self, frame: Bytes) -> std::io::Result<()> {
        self.inner
            .send(Message::Binary(frame))
            .await
            .map_err(std::io::Error::other)
    }

    async fn recv(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            match self.inner.recv().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(std::io::Error::other(e)),
                Some(Ok(Message::Binary(raw))) => return Ok(Some(raw)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.inner
            .send(Message::Close(None))
            .await
            .map_err(std::io::Error::other)
    }
}

/// Byte-stream view of an accepted proxy-port socket, so spliced TCP
/// payload can flow through `copy_bidirectional`.
pub struct AxumWsConn {
    inner: WebSocket,
    read_buf: BytesMut,
}

impl AxumWsConn {
    pub fn new(inner: WebSocket) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
        }
    }
}

impl AsyncRead for AxumWsConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf[..n]);
                self.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) | Poll::Ready(Some(Ok(Message::Close(_)))) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Binary(raw)))) => {
                    self.read_buf.extend_from_slice(&raw);
                }
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::other(e)));
                }
            }
        }
    }
}

impl AsyncWrite for AxumWsConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(std::io::Error::other(e))),
            Poll::Ready(Ok(())) => {}
        }
        let message = Message::Binary(Bytes::copy_from_slice(buf));
        match Pin::new(&mut self.inner).start_send(message) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(std::io::Error::other(e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(std::io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(std::io::Error::other)
    }
}
