// piko-protocol: Tunnel wire types and framing.
//
// Every control payload on a tunnel stream is JSON, length-prefixed with an
// 8-byte big-endian length.  Streams themselves are typed at open time by a
// `StreamKind` byte carried in the multiplexer's Open frame.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ---------------------------------------------------------------------------
// Stream kinds
// ---------------------------------------------------------------------------

/// Multiplexer stream types.
///
/// `Listen` streams carry a single Listen RPC (request, response, close).
/// `Proxy` streams carry a `ProxyHeader` followed by raw payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Proxy,
}

impl StreamKind {
    pub fn as_u8(self) -> u8 {
        match self {
            StreamKind::Listen => 1,
            StreamKind::Proxy => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(StreamKind::Listen),
            2 => Some(StreamKind::Proxy),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Proxied stream header
// ---------------------------------------------------------------------------

/// First frame on every proxied stream, before payload bytes.
///
/// The receiving listener checks `endpoint_id` against its own registration
/// and rejects mismatches as protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHeader {
    pub endpoint_id: String,
}

// ---------------------------------------------------------------------------
// Listen RPC
// ---------------------------------------------------------------------------

/// Request body of the Listen RPC (upstream -> server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenRequest {
    pub endpoint_id: String,
}

/// Response body of the Listen RPC.
///
/// `error` is `None` on success and one of the frozen [`error_codes`]
/// otherwise.  The endpoint ID is echoed back for correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenResponse {
    pub endpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Frozen wire-level error strings.
pub mod error_codes {
    /// Listen RPC rejection: token's endpoint list excludes the requested ID.
    pub const ENDPOINT_NOT_PERMITTED: &str = "endpoint not permitted";
    /// Proxy dispatch failure: no upstream, local or remote, at dispatch time.
    pub const NO_AVAILABLE_UPSTREAMS: &str = "no available upstreams";
    /// Auth failures, surfaced as HTTP 401 bodies before any session exists.
    pub const MISSING_AUTHORIZATION: &str = "missing authorization";
    pub const INVALID_TOKEN: &str = "invalid token";
}

/// The HTTP error envelope used by every non-2xx proxy response.
///
/// ```json
/// {"error":"no available upstreams"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Length-prefixed JSON framing
// ---------------------------------------------------------------------------

/// Upper bound on a single control frame.  Proxy headers and RPC bodies are
/// tiny; anything near this limit is a corrupt or hostile peer.
pub const MAX_FRAME_LEN: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds maximum")]
    TooLarge(u64),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Write `value` as JSON with an 8-byte big-endian length prefix.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() as u64 > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len() as u64));
    }
    writer.write_all(&(body.len() as u64).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame and deserialize it.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf).await?;
    let len = u64::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_preserves_proxy_header() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let header = ProxyHeader {
            endpoint_id: "my-endpoint".to_owned(),
        };
        write_frame(&mut a, &header).await.unwrap();
        let read: ProxyHeader = read_frame(&mut b).await.unwrap();
        assert_eq!(read, header);
    }

    #[tokio::test]
    async fn frame_prefix_is_eight_byte_big_endian() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, &ListenRequest {
            endpoint_id: "e".to_owned(),
        })
        .await
        .unwrap();

        let mut prefix = [0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut prefix)
            .await
            .unwrap();
        let len = u64::from_be_bytes(prefix);
        let expected = serde_json::to_vec(&ListenRequest {
            endpoint_id: "e".to_owned(),
        })
        .unwrap()
        .len() as u64;
        assert_eq!(len, expected);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocation() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bogus = (MAX_FRAME_LEN + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus)
            .await
            .unwrap();
        let err = read_frame::<_, ProxyHeader>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn truncated_frame_surfaces_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &8u64.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, b"{...")
            .await
            .unwrap();
        drop(a);
        let err = read_frame::<_, ProxyHeader>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[test]
    fn listen_response_error_field_is_omitted_when_none() {
        let ok = ListenResponse {
            endpoint_id: "e".to_owned(),
            error: None,
        };
        let json = serde_json::to_string(&ok).unwrap();
        assert_eq!(json, r#"{"endpoint_id":"e"}"#);

        let denied: ListenResponse =
            serde_json::from_str(r#"{"endpoint_id":"e","error":"endpoint not permitted"}"#)
                .unwrap();
        assert_eq!(
            denied.error.as_deref(),
            Some(error_codes::ENDPOINT_NOT_PERMITTED)
        );
    }

    #[test]
    fn stream_kind_bytes_are_stable() {
        assert_eq!(StreamKind::Listen.as_u8(), 1);
        assert_eq!(StreamKind::Proxy.as_u8(), 2);
        assert_eq!(StreamKind::from_u8(1), Some(StreamKind::Listen));
        assert_eq!(StreamKind::from_u8(2), Some(StreamKind::Proxy));
        assert_eq!(StreamKind::from_u8(3), None);
    }
}
