use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::stream::MuxStream;
use crate::transport::FrameTransport;
use crate::MuxError;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Session tuning knobs.  Both peers must agree on `window` since the
/// initial send credit is not negotiated on the wire.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial (and maximum outstanding) per-stream send window, bytes.
    pub window: u32,
    /// Largest data frame payload.
    pub max_frame: usize,
    /// Per-stream user-side buffer.
    pub stream_buffer: usize,
    /// Incoming streams queued before the session stalls waiting on `accept`.
    pub accept_backlog: usize,
    pub keepalive_interval: Duration,
    /// Outstanding unanswered pings that abort the session.
    pub max_missed_pings: u32,
    /// How long `close` waits for open streams to quiesce.
    pub drain_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window: 256 * 1024,
            max_frame: 16 * 1024,
            stream_buffer: 64 * 1024,
            accept_backlog: 32,
            keepalive_interval: Duration::from_secs(10),
            max_missed_pings: 3,
            drain_grace: Duration::from_secs(5),
        }
    }
}

/// Which side of the tunnel this session is.  Clients open odd stream IDs,
/// servers even, so both sides can open without collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// No new streams are opened or accepted; existing streams run until
    /// quiesced or the drain grace expires.
    Draining,
    Closed,
}

// ---------------------------------------------------------------------------
// Per-stream send window
// ---------------------------------------------------------------------------

struct WindowInner {
    credit: u32,
    closed: bool,
}

/// Credit budget for one stream's send direction.  A single pump task waits
/// on it, so `notify_one` suffices.
struct Window {
    inner: Mutex<WindowInner>,
    notify: Notify,
}

impl Window {
    fn new(initial: u32) -> Self {
        Self {
            inner: Mutex::new(WindowInner {
                credit: initial,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn grant(&self, n: u32) {
        let mut inner = lock(&self.inner);
        inner.credit = inner.credit.saturating_add(n);
        self.notify.notify_one();
    }

    fn close(&self) {
        lock(&self.inner).closed = true;
        self.notify.notify_one();
    }

    /// Take up to `want` bytes of credit, waiting for a grant if none is
    /// available.  Returns `None` once the window is closed.
    async fn acquire(&self, want: u32) -> Option<u32> {
        loop {
            {
                let mut inner = lock(&self.inner);
                if inner.closed {
                    return None;
                }
                if inner.credit > 0 {
                    let take = want.min(inner.credit);
                    inner.credit -= take;
                    return Some(take);
                }
            }
            self.notify.notified().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Shared session state
// ---------------------------------------------------------------------------

const HALF_IN: u8 = 0b01;
const HALF_OUT: u8 = 0b10;

struct StreamEntry {
    inbound_tx: Option<mpsc::UnboundedSender<Bytes>>,
    window: Arc<Window>,
    finished: u8,
}

struct Shared {
    config: SessionConfig,
    state: Mutex<SessionState>,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    frame_tx: mpsc::Sender<Frame>,
    next_id: AtomicU32,
    /// Parity bit of locally opened stream IDs.
    local_parity: u32,
    closed: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Shared {
    /// Create the stream plumbing for `id` and return the user handle.
    ///
    /// Two pump tasks bridge the user-side duplex and the frame channel:
    /// outbound chunks user writes under the send window; inbound delivers
    /// peer data and grants window credit only after delivery, which is
    /// what keeps a slow consumer from stalling its siblings.
    fn register_stream(self: &Arc<Self>, id: u32) -> MuxStream {
        let (user_io, mux_io) = tokio::io::duplex(self.config.stream_buffer);
        let (mux_read, mux_write) = tokio::io::split(mux_io);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let window = Arc::new(Window::new(self.config.window));

        lock(&self.streams).insert(
            id,
            StreamEntry {
                inbound_tx: Some(inbound_tx),
                window: Arc::clone(&window),
                finished: 0,
            },
        );

        tokio::spawn(outbound_pump(Arc::clone(self), id, mux_read, window));
        tokio::spawn(inbound_pump(Arc::clone(self), id, inbound_rx, mux_write));

        MuxStream::new(id, user_io)
    }

    fn finish_half(&self, id: u32, half: u8) {
        let mut streams = lock(&self.streams);
        if let Some(entry) = streams.get_mut(&id) {
            entry.finished |= half;
            if entry.finished == HALF_IN | HALF_OUT {
                streams.remove(&id);
            }
        }
    }

    /// Stop delivering inbound data for `id` (peer FIN, or reader gone).
    fn take_inbound(&self, id: u32) {
        if let Some(entry) = lock(&self.streams).get_mut(&id) {
            entry.inbound_tx = None;
        }
    }

    fn set_state(&self, next: SessionState) {
        *lock(&self.state) = next;
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Tear everything down: poison windows so writers unblock, drop inbound
    /// senders so readers hit EOF, and cancel the session token.
    fn abort(&self) {
        self.set_state(SessionState::Closed);
        self.closed.cancel();
        for (_, entry) in lock(&self.streams).drain() {
            entry.window.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Stream pumps
// ---------------------------------------------------------------------------

async fn outbound_pump(
    shared: Arc<Shared>,
    id: u32,
    mut rd: ReadHalf<DuplexStream>,
    window: Arc<Window>,
) {
    let mut buf = vec![0u8; shared.config.max_frame];
    let mut clean = true;
    'outer: loop {
        let n = tokio::select! {
            _ = shared.closed.cancelled() => {
                clean = false;
                break;
            }
            r = rd.read(&mut buf) => match r {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => {
                    clean = false;
                    break;
                }
            },
        };
        let mut off = 0;
        while off < n {
            let want = (n - off) as u32;
            let take = tokio::select! {
                _ = shared.closed.cancelled() => None,
                t = window.acquire(want) => t,
            };
            let Some(take) = take else {
                clean = false;
                break 'outer;
            };
            let payload = Bytes::copy_from_slice(&buf[off..off + take as usize]);
            if shared
                .frame_tx
                .send(Frame::Data {
                    stream_id: id,
                    payload,
                })
                .await
                .is_err()
            {
                clean = false;
                break 'outer;
            }
            off += take as usize;
        }
    }
    if clean {
        let _ = shared.frame_tx.send(Frame::Fin { stream_id: id }).await;
    } else if !shared.closed.is_cancelled() {
        let _ = shared.frame_tx.send(Frame::Rst { stream_id: id }).await;
    }
    shared.finish_half(id, HALF_OUT);
}

async fn inbound_pump(
    shared: Arc<Shared>,
    id: u32,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut wr: WriteHalf<DuplexStream>,
) {
    while let Some(chunk) = rx.recv().await {
        let len = chunk.len() as u32;
        let delivered = tokio::select! {
            _ = shared.closed.cancelled() => false,
            w = wr.write_all(&chunk) => w.is_ok(),
        };
        if !delivered {
            // Reader is gone (stream dropped) or the session died; either
            // way stop the peer's send side.
            if !shared.closed.is_cancelled() {
                let _ = shared.frame_tx.send(Frame::Rst { stream_id: id }).await;
            }
            shared.take_inbound(id);
            break;
        }
        let _ = shared
            .frame_tx
            .send(Frame::Window {
                stream_id: id,
                credit: len,
            })
            .await;
    }
    let _ = wr.shutdown().await;
    shared.finish_half(id, HALF_IN);
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A live multiplexed session.  Cheap to clone; all clones share one
/// underlying transport and close together.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(MuxStream, u8)>>>,
}

impl Session {
    /// Start a session over `transport` and spawn its driver task.
    pub fn spawn<T: FrameTransport>(transport: T, role: Role, config: SessionConfig) -> Session {
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (first_id, local_parity) = match role {
            Role::Client => (1, 1),
            Role::Server => (2, 0),
        };
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(SessionState::Open),
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            next_id: AtomicU32::new(first_id),
            local_parity,
            closed: CancellationToken::new(),
        });
        tokio::spawn(drive(Arc::clone(&shared), transport, frame_rx, accept_tx));
        Session {
            shared,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
        }
    }

    /// Open a new stream tagged with an application-level kind byte.
    pub async fn open_stream(&self, kind: u8) -> Result<MuxStream, MuxError> {
        if self.shared.state() != SessionState::Open {
            return Err(MuxError::SessionClosed);
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.register_stream(id);
        if self
            .shared
            .frame_tx
            .send(Frame::Open {
                stream_id: id,
                kind,
            })
            .await
            .is_err()
        {
            lock(&self.shared.streams).remove(&id);
            return Err(MuxError::SessionClosed);
        }
        Ok(stream)
    }

    /// Wait for the peer to open a stream.
    pub async fn accept(&self) -> Result<(MuxStream, u8), MuxError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.shared.closed.cancelled() => Err(MuxError::SessionClosed),
            next = rx.recv() => next.ok_or(MuxError::SessionClosed),
        }
    }

    /// Open a stream, send one length-prefixed JSON request, and read one
    /// length-prefixed JSON response.  The caller bounds this with its own
    /// timeout.
    pub async fn rpc<Req, Resp>(&self, kind: u8, request: &Req) -> Result<Resp, MuxError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut stream = self.open_stream(kind).await?;
        piko_protocol::write_frame(&mut stream, request)
            .await
            .map_err(|e| self.map_codec(e))?;
        let response = piko_protocol::read_frame(&mut stream)
            .await
            .map_err(|e| self.map_codec(e))?;
        Ok(response)
    }

    fn map_codec(&self, err: piko_protocol::FrameError) -> MuxError {
        if self.shared.closed.is_cancelled() {
            MuxError::SessionClosed
        } else {
            MuxError::Codec(err)
        }
    }

    /// Graceful close: announce `GoAway`, refuse new opens, wait for open
    /// streams to quiesce (bounded by `drain_grace`), then abort.
    pub async fn close(&self) {
        if self.shared.state() == SessionState::Open {
            self.shared.set_state(SessionState::Draining);
            let _ = self.shared.frame_tx.send(Frame::GoAway).await;
        }
        let deadline = Instant::now() + self.shared.config.drain_grace;
        while Instant::now() < deadline {
            if lock(&self.shared.streams).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.shared.abort();
    }

    /// Immediate teardown; every pending operation fails with
    /// [`MuxError::SessionClosed`].
    pub fn abort(&self) {
        self.shared.abort();
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves when the session is fully closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

async fn drive<T: FrameTransport>(
    shared: Arc<Shared>,
    mut transport: T,
    mut frame_rx: mpsc::Receiver<Frame>,
    accept_tx: mpsc::Sender<(MuxStream, u8)>,
) {
    let mut keepalive = tokio::time::interval(shared.config.keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;
    let mut outstanding_pings: u32 = 0;
    let mut ping_seq: u32 = 0;

    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            out = frame_rx.recv() => match out {
                Some(frame) => {
                    if transport.send(frame.encode()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inc = transport.recv() => match inc {
                Ok(Some(raw)) => match Frame::decode(raw) {
                    Ok(frame) => {
                        // Any inbound traffic proves the carrier is alive.
                        outstanding_pings = 0;
                        if !handle_frame(&shared, frame, &accept_tx, &mut transport).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "mux frame decode failed, closing session");
                        break;
                    }
                },
                Ok(None) => {
                    debug!("transport closed by peer");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "transport error");
                    break;
                }
            },
            _ = keepalive.tick() => {
                if outstanding_pings >= shared.config.max_missed_pings {
                    warn!(outstanding = outstanding_pings, "keepalive timeout, closing session");
                    break;
                }
                ping_seq = ping_seq.wrapping_add(1);
                outstanding_pings += 1;
                if transport.send(Frame::Ping { seq: ping_seq }.encode()).await.is_err() {
                    break;
                }
            }
        }
    }

    shared.abort();
    let _ = transport.close().await;
}

/// Apply one peer frame.  Returns false when the session must close.
async fn handle_frame<T: FrameTransport>(
    shared: &Arc<Shared>,
    frame: Frame,
    accept_tx: &mpsc::Sender<(MuxStream, u8)>,
    transport: &mut T,
) -> bool {
    match frame {
        Frame::Open { stream_id, kind } => {
            if stream_id % 2 == shared.local_parity {
                warn!(stream_id, "peer opened a stream in our id space");
                return false;
            }
            if lock(&shared.streams).contains_key(&stream_id) {
                warn!(stream_id, "peer reopened a live stream");
                return false;
            }
            if shared.state() != SessionState::Open {
                return transport
                    .send(Frame::Rst { stream_id }.encode())
                    .await
                    .is_ok();
            }
            let stream = shared.register_stream(stream_id);
            if accept_tx.send((stream, kind)).await.is_err() {
                // Session handle dropped without accepting; refuse.
                let _ = transport.send(Frame::Rst { stream_id }.encode()).await;
            }
            true
        }
        Frame::Data { stream_id, payload } => {
            let streams = lock(&shared.streams);
            if let Some(tx) = streams
                .get(&stream_id)
                .and_then(|entry| entry.inbound_tx.as_ref())
            {
                let _ = tx.send(payload);
            }
            true
        }
        Frame::Window { stream_id, credit } => {
            if let Some(entry) = lock(&shared.streams).get(&stream_id) {
                entry.window.grant(credit);
            }
            true
        }
        Frame::Fin { stream_id } => {
            shared.take_inbound(stream_id);
            true
        }
        Frame::Rst { stream_id } => {
            if let Some(entry) = lock(&shared.streams).remove(&stream_id) {
                entry.window.close();
            }
            true
        }
        Frame::Ping { seq } => transport.send(Frame::Pong { seq }.encode()).await.is_ok(),
        Frame::Pong { .. } => true,
        Frame::GoAway => {
            // Peer is draining; stop opening new streams toward it.
            if shared.state() == SessionState::Open {
                shared.set_state(SessionState::Draining);
            }
            true
        }
    }
}
