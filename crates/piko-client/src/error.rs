/// A dial failure, classified for retry.
///
/// Network failures and 5xx upgrade rejections are worth retrying; 4xx
/// rejections (bad token, unknown route) are terminal, with 429 as the one
/// retryable exception.
#[derive(Debug, Clone)]
pub struct DialError {
    pub message: String,
    pub retryable: bool,
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.retryable {
            write!(f, "{} (retryable)", self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("connect: {0}")]
    Connect(DialError),
    /// The server refused the Listen registration (e.g. the token does not
    /// permit the endpoint).  Never retried.
    #[error("listen rejected: {0}")]
    Rejected(String),
    #[error("session closed")]
    SessionClosed,
    #[error("cancelled")]
    Cancelled,
    #[error("listen timed out")]
    Timeout,
    #[error("protocol: {0}")]
    Protocol(String),
    #[error(transparent)]
    Mux(#[from] piko_mux::MuxError),
}
