use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::upstream::Listener;

/// Splice every connection accepted from `listener` with a fresh TCP
/// connection to `addr`.  Completes when the listener closes.
///
/// This is the whole agent data plane: the proxy header has already been
/// stripped by the listener, so what remains is raw payload in both
/// directions.
pub async fn forward(listener: &Listener, addr: &str) -> Result<(), ClientError> {
    loop {
        let mut conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(ClientError::SessionClosed | ClientError::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        };
        let addr = addr.to_owned();
        let endpoint_id = listener.endpoint_id().to_owned();
        tokio::spawn(async move {
            let mut upstream = match TcpStream::connect(&addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%endpoint_id, %addr, error = %e, "forward target unreachable");
                    return;
                }
            };
            match tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
                Ok((sent, received)) => {
                    debug!(%endpoint_id, sent, received, "forwarded connection done");
                }
                Err(e) => {
                    debug!(%endpoint_id, error = %e, "forwarded connection ended with error");
                }
            }
        });
    }
}
