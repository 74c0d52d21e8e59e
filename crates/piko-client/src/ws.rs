//! WebSocket plumbing: authenticated dials, the mux frame transport, and a
//! byte-stream adapter for raw TCP tunneling.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::DialError;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Classify a handshake failure: 4xx rejections are terminal (except 429),
/// everything else — connection refused, resets, 5xx — is retryable.
fn classify(err: &tokio_tungstenite::tungstenite::Error) -> bool {
    use tokio_tungstenite::tungstenite::Error;
    match err {
        Error::Http(response) => {
            let status = response.status();
            !status.is_client_error() || status.as_u16() == 429
        }
        Error::Url(_) => false,
        _ => true,
    }
}

/// Dial `url` with an optional bearer token and extra headers.
///
/// Delegates to [`IntoClientRequest`] so the WebSocket upgrade headers are
/// populated before ours are injected.
pub(crate) async fn dial_ws(
    url: &str,
    token: Option<&str>,
    extra_headers: &[(&str, &str)],
) -> Result<WsStream, DialError> {
    let mut request = url.into_client_request().map_err(|e| DialError {
        message: format!("invalid URL '{url}': {e}"),
        retryable: false,
    })?;
    if let Some(token) = token {
        let value = format!("Bearer {token}").parse().map_err(|_| DialError {
            message: "token is not a valid header value".to_owned(),
            retryable: false,
        })?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }
    for (name, value) in extra_headers {
        let name: header::HeaderName = name.parse().map_err(|_| DialError {
            message: format!("invalid header name '{name}'"),
            retryable: false,
        })?;
        let value = value.parse().map_err(|_| DialError {
            message: format!("invalid header value for '{name}'"),
            retryable: false,
        })?;
        request.headers_mut().insert(name, value);
    }

    match connect_async(request).await {
        Ok((stream, _response)) => Ok(stream),
        Err(e) => Err(DialError {
            retryable: classify(&e),
            message: e.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Mux frame transport
// ---------------------------------------------------------------------------

/// Carries mux frames as binary WebSocket messages.
///
/// Pings are answered by tungstenite itself; text and pong messages are
/// ignored.
pub(crate) struct WsTransport {
    inner: WsStream,
}

impl WsTransport {
    pub(crate) fn new(inner: WsStream) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl piko_mux::FrameTransport for WsTransport {
    async fn send(&mut self, frame: Bytes) -> std::io::Result<()> {
        self.inner
            .send(Message::Binary(frame.into()))
            .await
            .map_err(std::io::Error::other)
    }

    async fn recv(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(std::io::Error::other(e)),
                Some(Ok(Message::Binary(raw))) => return Ok(Some(Bytes::from(raw))),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.inner.close(None).await.map_err(std::io::Error::other)
    }
}

// ---------------------------------------------------------------------------
// Byte-stream adapter
// ---------------------------------------------------------------------------

/// A TCP-like byte stream over binary WebSocket messages; the connection
/// type returned by [`crate::Dialer::dial`].
#[derive(Debug)]
pub struct WsConn {
    inner: WsStream,
    read_buf: BytesMut,
}

impl WsConn {
    pub(crate) fn new(inner: WsStream) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
        }
    }
}

impl AsyncRead for WsConn {
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

impl AsyncWrite for WsConn {
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
        let message = Message::Binary(Bytes::copy_from_slice(buf).into());
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
