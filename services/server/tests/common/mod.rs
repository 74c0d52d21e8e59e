// Shared setup for the server integration suites: in-process nodes on
// ephemeral ports with fast gossip.

#![allow(dead_code)]

use std::time::Duration;

use piko_client::UpstreamConfig;
use piko_server::{Node, ServerConfig};

pub async fn start_node(hmac_secret: Option<&str>, seeds: Vec<String>) -> Node {
    let mut config = ServerConfig::default();
    config.proxy.bind = "127.0.0.1:0".parse().unwrap();
    config.proxy.http_timeout = Duration::from_secs(5);
    config.upstream.bind = "127.0.0.1:0".parse().unwrap();
    config.admin.bind = "127.0.0.1:0".parse().unwrap();
    config.gossip.bind = "127.0.0.1:0".parse().unwrap();
    config.gossip.join = seeds;
    config.gossip.interval = Duration::from_millis(100);
    config.auth.hmac_secret = hmac_secret.map(ToOwned::to_owned);
    config.grace_period = Duration::from_secs(1);
    Node::start(config).await.expect("node should start")
}

pub fn upstream_config(node: &Node) -> UpstreamConfig {
    let mut config = UpstreamConfig::new(format!("ws://{}", node.upstream_addr()));
    config.backoff_base = Duration::from_millis(50);
    config.backoff_max = Duration::from_secs(1);
    config
}

pub fn proxy_url(node: &Node) -> String {
    format!("http://{}", node.proxy_addr())
}

pub fn proxy_ws_url(node: &Node) -> String {
    format!("ws://{}", node.proxy_addr())
}
