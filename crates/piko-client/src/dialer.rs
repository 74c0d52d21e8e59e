use crate::error::ClientError;
use crate::ws::{dial_ws, WsConn};

/// Downstream raw-TCP dialer: opens a WebSocket-tunneled byte stream to an
/// endpoint through a node's proxy port.
#[derive(Debug, Clone)]
pub struct Dialer {
    /// Proxy port base URL, e.g. `ws://127.0.0.1:8000`.
    pub url: String,
    pub token: Option<String>,
}

impl Dialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
        }
    }

    pub async fn dial(&self, endpoint_id: &str) -> Result<WsConn, ClientError> {
        self.dial_inner(endpoint_id, &[]).await
    }

    /// Dial with the node-to-node forwarding marker set.  The receiving
    /// node resolves the endpoint strictly locally, which is what bounds
    /// routing to a single extra hop.
    pub async fn dial_forwarded(&self, endpoint_id: &str) -> Result<WsConn, ClientError> {
        self.dial_inner(endpoint_id, &[("x-piko-forwarded", "1")])
            .await
    }

    async fn dial_inner(
        &self,
        endpoint_id: &str,
        headers: &[(&str, &str)],
    ) -> Result<WsConn, ClientError> {
        let url = format!(
            "{}/_piko/v1/tcp/{}",
            self.url.trim_end_matches('/'),
            endpoint_id
        );
        let ws = dial_ws(&url, self.token.as_deref(), headers)
            .await
            .map_err(ClientError::Connect)?;
        Ok(WsConn::new(ws))
    }
}
