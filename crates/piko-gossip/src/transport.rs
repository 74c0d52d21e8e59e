//! TCP anti-entropy exchanges.
//!
//! Messages are JSON in length-delimited frames.  Digest/delta semantics
//! are transport-agnostic; running both over one reliable channel keeps a
//! single code path for small digests and large deltas alike.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gossiper::{GossipError, Shared};
use crate::wire::Message;

type Channel = Framed<TcpStream, LengthDelimitedCodec>;

async fn send_msg(channel: &mut Channel, msg: &Message) -> Result<(), GossipError> {
    let raw = serde_json::to_vec(msg)?;
    channel.send(Bytes::from(raw)).await?;
    Ok(())
}

async fn recv_msg(channel: &mut Channel) -> Result<Message, GossipError> {
    let raw = channel
        .next()
        .await
        .ok_or(GossipError::PeerClosed)??;
    Ok(serde_json::from_slice(&raw)?)
}

/// Initiate one round with `peer_addr`: `SYN -> SYN-ACK -> ACK2`.
pub(crate) async fn exchange(shared: &Arc<Shared>, peer_addr: &str) -> Result<(), GossipError> {
    let stream = TcpStream::connect(peer_addr).await?;
    let mut channel = Framed::new(stream, LengthDelimitedCodec::new());

    let digest = shared.state().digest();
    send_msg(&mut channel, &Message::Syn { digest }).await?;

    let (peer_digest, delta) = match recv_msg(&mut channel).await? {
        Message::SynAck { digest, delta } => (digest, delta),
        other => {
            return Err(GossipError::Protocol(format!(
                "expected syn_ack, got {other:?}"
            )))
        }
    };

    let (ack_delta, local_id) = {
        let mut state = shared.state();
        state.observe_digest(&peer_digest);
        state.apply_delta(&delta);
        (state.delta_for(&peer_digest), state.local_id().clone())
    };
    shared
        .detector()
        .record_contact(&peer_digest.sender, Instant::now());

    send_msg(
        &mut channel,
        &Message::Ack2 {
            sender: local_id,
            delta: ack_delta,
        },
    )
    .await?;
    Ok(())
}

/// Answer rounds initiated by peers until shutdown.
pub(crate) async fn serve(
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let shared = Arc::clone(&shared);
                let timeout = shared.round_timeout;
                tokio::spawn(async move {
                    let answer = tokio::time::timeout(timeout, answer_peer(stream, &shared));
                    match answer.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(peer = %peer, error = %e, "gossip exchange failed"),
                        Err(_) => debug!(peer = %peer, "gossip exchange timed out"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "gossip accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn answer_peer(stream: TcpStream, shared: &Arc<Shared>) -> Result<(), GossipError> {
    let mut channel = Framed::new(stream, LengthDelimitedCodec::new());

    let digest = match recv_msg(&mut channel).await? {
        Message::Syn { digest } => digest,
        other => {
            return Err(GossipError::Protocol(format!(
                "expected syn, got {other:?}"
            )))
        }
    };

    let (reply_digest, delta) = {
        let mut state = shared.state();
        state.observe_digest(&digest);
        let delta = state.delta_for(&digest);
        (state.digest(), delta)
    };
    shared
        .detector()
        .record_contact(&digest.sender, Instant::now());

    send_msg(
        &mut channel,
        &Message::SynAck {
            digest: reply_digest,
            delta,
        },
    )
    .await?;

    let (sender, delta) = match recv_msg(&mut channel).await? {
        Message::Ack2 { sender, delta } => (sender, delta),
        other => {
            return Err(GossipError::Protocol(format!(
                "expected ack2, got {other:?}"
            )))
        }
    };
    shared.state().apply_delta(&delta);
    shared.detector().record_contact(&sender, Instant::now());
    Ok(())
}
