//! Binary frame layout: one frame per transport message.
//!
//! ```text
//! [kind: u8][stream_id: u32 BE][payload...]
//! ```
//!
//! `Ping`/`Pong` reuse the stream-id field as a sequence number; `GoAway`
//! carries neither.

use bytes::{BufMut, Bytes, BytesMut};

use crate::MuxError;

pub const KIND_OPEN: u8 = 1;
pub const KIND_DATA: u8 = 2;
pub const KIND_WINDOW: u8 = 3;
pub const KIND_FIN: u8 = 4;
pub const KIND_RST: u8 = 5;
pub const KIND_PING: u8 = 6;
pub const KIND_PONG: u8 = 7;
pub const KIND_GO_AWAY: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Open stream `stream_id` with an application-level stream kind byte.
    Open { stream_id: u32, kind: u8 },
    Data { stream_id: u32, payload: Bytes },
    /// Grant `credit` additional send-window bytes for `stream_id`.
    Window { stream_id: u32, credit: u32 },
    /// Write-half close: no more data will arrive for `stream_id`.
    Fin { stream_id: u32 },
    /// Hard stream abort, both directions.
    Rst { stream_id: u32 },
    Ping { seq: u32 },
    Pong { seq: u32 },
    /// Sender is draining: it will not accept new streams.
    GoAway,
}

impl Frame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Frame::Open { stream_id, kind } => {
                buf.put_u8(KIND_OPEN);
                buf.put_u32(*stream_id);
                buf.put_u8(*kind);
            }
            Frame::Data { stream_id, payload } => {
                buf.reserve(payload.len());
                buf.put_u8(KIND_DATA);
                buf.put_u32(*stream_id);
                buf.put_slice(payload);
            }
            Frame::Window { stream_id, credit } => {
                buf.put_u8(KIND_WINDOW);
                buf.put_u32(*stream_id);
                buf.put_u32(*credit);
            }
            Frame::Fin { stream_id } => {
                buf.put_u8(KIND_FIN);
                buf.put_u32(*stream_id);
            }
            Frame::Rst { stream_id } => {
                buf.put_u8(KIND_RST);
                buf.put_u32(*stream_id);
            }
            Frame::Ping { seq } => {
                buf.put_u8(KIND_PING);
                buf.put_u32(*seq);
            }
            Frame::Pong { seq } => {
                buf.put_u8(KIND_PONG);
                buf.put_u32(*seq);
            }
            Frame::GoAway => {
                buf.put_u8(KIND_GO_AWAY);
                buf.put_u32(0);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> Result<Frame, MuxError> {
        use bytes::Buf;

        if raw.len() < 5 {
            return Err(MuxError::Protocol(format!(
                "short frame: {} bytes",
                raw.len()
            )));
        }
        let kind = raw.get_u8();
        let stream_id = raw.get_u32();
        match kind {
            KIND_OPEN => {
                if raw.is_empty() {
                    return Err(MuxError::Protocol("open frame missing kind".to_owned()));
                }
                Ok(Frame::Open {
                    stream_id,
                    kind: raw.get_u8(),
                })
            }
            KIND_DATA => Ok(Frame::Data {
                stream_id,
                payload: raw,
            }),
            KIND_WINDOW => {
                if raw.len() < 4 {
                    return Err(MuxError::Protocol("window frame missing credit".to_owned()));
                }
                Ok(Frame::Window {
                    stream_id,
                    credit: raw.get_u32(),
                })
            }
            KIND_FIN => Ok(Frame::Fin { stream_id }),
            KIND_RST => Ok(Frame::Rst { stream_id }),
            KIND_PING => Ok(Frame::Ping { seq: stream_id }),
            KIND_PONG => Ok(Frame::Pong { seq: stream_id }),
            KIND_GO_AWAY => Ok(Frame::GoAway),
            other => Err(MuxError::Protocol(format!("unknown frame kind {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_roundtrip() {
        let frames = [
            Frame::Open {
                stream_id: 7,
                kind: 2,
            },
            Frame::Data {
                stream_id: 7,
                payload: Bytes::from_static(b"hello"),
            },
            Frame::Window {
                stream_id: 7,
                credit: 65536,
            },
            Frame::Fin { stream_id: 7 },
            Frame::Rst { stream_id: 9 },
            Frame::Ping { seq: 3 },
            Frame::Pong { seq: 3 },
            Frame::GoAway,
        ];
        for frame in frames {
            let decoded = Frame::decode(frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn short_and_unknown_frames_are_protocol_errors() {
        assert!(matches!(
            Frame::decode(Bytes::from_static(b"\x01")),
            Err(MuxError::Protocol(_))
        ));
        assert!(matches!(
            Frame::decode(Bytes::from_static(b"\xff\x00\x00\x00\x01")),
            Err(MuxError::Protocol(_))
        ));
    }
}
