//! piko-mux: bidirectional stream multiplexing over one frame transport.
//!
//! A [`Session`] runs over any ordered, reliable carrier of binary frames
//! (in practice a WebSocket connection; in tests an in-memory channel pair).
//! Either side may open streams and either side may accept them.  Streams
//! are byte-oriented, independently half-closable, and flow-controlled with
//! per-stream credit windows so one slow stream never stalls the rest.
//!
//! A mux-level keepalive ping detects dead carriers; a configurable number
//! of missed pings aborts the session, failing every pending operation with
//! [`MuxError::SessionClosed`].

mod error;
mod frame;
mod session;
mod stream;
pub mod transport;

pub use error::MuxError;
pub use session::{Role, Session, SessionConfig, SessionState};
pub use stream::MuxStream;
pub use transport::FrameTransport;
