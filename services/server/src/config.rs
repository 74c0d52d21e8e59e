//! Server node configuration.
//!
//! TOML is the sole config source.  Every section is optional in the file;
//! missing fields fall back to the defaults below.  Validation happens in
//! one place, after raw deserialization, so a bad file is reported as a
//! configuration error (exit code 2) rather than a panic mid-startup.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub admin: AdminConfig,
    pub gossip: GossipSection,
    pub auth: AuthConfig,
    /// How long in-flight proxied streams get to finish on shutdown.
    pub grace_period: Duration,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind: SocketAddr,
    /// Bounds upstream dial plus response headers for one proxied request.
    pub http_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub bind: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub bind: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct GossipSection {
    pub bind: SocketAddr,
    /// Address peers dial; defaults to the bound address.
    pub advertise_addr: Option<String>,
    pub join: Vec<String>,
    pub interval: Duration,
    pub suspicion_threshold: f64,
    pub node_expiry: Duration,
    pub compaction_threshold: usize,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HS256 secret for upstream endpoint tokens.  Unset disables auth.
    pub hmac_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig {
                bind: "0.0.0.0:8000".parse().expect("static addr"),
                http_timeout: Duration::from_secs(30),
            },
            upstream: UpstreamConfig {
                bind: "0.0.0.0:8001".parse().expect("static addr"),
            },
            admin: AdminConfig {
                bind: "0.0.0.0:8002".parse().expect("static addr"),
            },
            gossip: GossipSection {
                bind: "0.0.0.0:8003".parse().expect("static addr"),
                advertise_addr: None,
                join: Vec::new(),
                interval: Duration::from_secs(1),
                suspicion_threshold: 8.0,
                node_expiry: Duration::from_secs(30),
                compaction_threshold: 100,
            },
            auth: AuthConfig { hmac_secret: None },
            grace_period: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&raw)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let proxy = raw.proxy.unwrap_or_default();
        let upstream = raw.upstream.unwrap_or_default();
        let admin = raw.admin.unwrap_or_default();
        let gossip = raw.gossip.unwrap_or_default();
        let auth = raw.auth.unwrap_or_default();

        let config = ServerConfig {
            proxy: ProxyConfig {
                bind: parse_addr("proxy.bind", proxy.bind, defaults.proxy.bind)?,
                http_timeout: proxy
                    .http_timeout_secs
                    .map_or(defaults.proxy.http_timeout, Duration::from_secs),
            },
            upstream: UpstreamConfig {
                bind: parse_addr("upstream.bind", upstream.bind, defaults.upstream.bind)?,
            },
            admin: AdminConfig {
                bind: parse_addr("admin.bind", admin.bind, defaults.admin.bind)?,
            },
            gossip: GossipSection {
                bind: parse_addr("gossip.bind", gossip.bind, defaults.gossip.bind)?,
                advertise_addr: gossip.advertise_addr,
                join: gossip.join.unwrap_or_default(),
                interval: gossip
                    .interval_ms
                    .map_or(defaults.gossip.interval, Duration::from_millis),
                suspicion_threshold: gossip
                    .suspicion_threshold
                    .unwrap_or(defaults.gossip.suspicion_threshold),
                node_expiry: gossip
                    .node_expiry_secs
                    .map_or(defaults.gossip.node_expiry, Duration::from_secs),
                compaction_threshold: gossip
                    .compaction_threshold
                    .unwrap_or(defaults.gossip.compaction_threshold),
            },
            auth: AuthConfig {
                hmac_secret: auth.hmac_secret,
            },
            grace_period: raw
                .grace_period_secs
                .map_or(defaults.grace_period, Duration::from_secs),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.gossip.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "gossip.interval_ms must be positive".to_owned(),
            ));
        }
        if self.gossip.suspicion_threshold <= 0.0 {
            return Err(ConfigError::Invalid(
                "gossip.suspicion_threshold must be positive".to_owned(),
            ));
        }
        if self
            .auth
            .hmac_secret
            .as_ref()
            .is_some_and(|secret| secret.is_empty())
        {
            return Err(ConfigError::Invalid(
                "auth.hmac_secret must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

fn parse_addr(
    field: &str,
    value: Option<String>,
    default: SocketAddr,
) -> Result<SocketAddr, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{field}: '{raw}' is not a socket address"))),
    }
}

// ---------------------------------------------------------------------------
// Raw TOML types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    proxy: Option<RawProxy>,
    upstream: Option<RawUpstream>,
    admin: Option<RawAdmin>,
    gossip: Option<RawGossip>,
    auth: Option<RawAuth>,
    grace_period_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProxy {
    bind: Option<String>,
    http_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUpstream {
    bind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAdmin {
    bind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGossip {
    bind: Option<String>,
    advertise_addr: Option<String>,
    join: Option<Vec<String>>,
    interval_ms: Option<u64>,
    suspicion_threshold: Option<f64>,
    node_expiry_secs: Option<u64>,
    compaction_threshold: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuth {
    hmac_secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<ServerConfig, ConfigError> {
        ServerConfig::from_raw(toml::from_str(toml_str).unwrap())
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.proxy.bind.port(), 8000);
        assert_eq!(config.upstream.bind.port(), 8001);
        assert_eq!(config.gossip.interval, Duration::from_secs(1));
        assert!(config.auth.hmac_secret.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config = parse(
            r#"
            grace_period_secs = 5

            [proxy]
            bind = "127.0.0.1:9000"
            http_timeout_secs = 3

            [gossip]
            bind = "127.0.0.1:9003"
            join = ["10.0.0.1:8003"]
            interval_ms = 250

            [auth]
            hmac_secret = "shhh"
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.bind.port(), 9000);
        assert_eq!(config.proxy.http_timeout, Duration::from_secs(3));
        assert_eq!(config.gossip.join, vec!["10.0.0.1:8003".to_owned()]);
        assert_eq!(config.gossip.interval, Duration::from_millis(250));
        assert_eq!(config.auth.hmac_secret.as_deref(), Some("shhh"));
        assert_eq!(config.grace_period, Duration::from_secs(5));
    }

    #[test]
    fn bad_bind_address_is_a_config_error() {
        let err = parse("[proxy]\nbind = \"not-an-addr\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_gossip_interval_is_rejected() {
        let err = parse("[gossip]\ninterval_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn empty_secret_is_rejected() {
        let err = parse("[auth]\nhmac_secret = \"\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
