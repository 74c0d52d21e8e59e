#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The session is closed; all pending opens, accepts, reads and writes
    /// fail with this once either side closes or the keepalive gives up.
    #[error("session closed")]
    SessionClosed,
    /// The peer violated the framing or stream-id rules.
    #[error("protocol: {0}")]
    Protocol(String),
    /// RPC payload could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(#[from] piko_protocol::FrameError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
