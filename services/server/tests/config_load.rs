// Configuration loading from a TOML file on disk.

use std::io::Write;
use std::time::Duration;

use piko_server::{ConfigError, ServerConfig};

#[test]
fn full_config_file_loads() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        grace_period_secs = 3

        [proxy]
        bind = "127.0.0.1:18000"
        http_timeout_secs = 10

        [upstream]
        bind = "127.0.0.1:18001"

        [admin]
        bind = "127.0.0.1:18002"

        [gossip]
        bind = "127.0.0.1:18003"
        advertise_addr = "10.1.2.3:18003"
        join = ["10.1.2.4:18003", "10.1.2.5:18003"]
        interval_ms = 500
        suspicion_threshold = 6.5
        node_expiry_secs = 20
        compaction_threshold = 50

        [auth]
        hmac_secret = "s3cret"
        "#
    )
    .unwrap();

    let config = ServerConfig::load(file.path()).unwrap();
    assert_eq!(config.proxy.bind.port(), 18000);
    assert_eq!(config.proxy.http_timeout, Duration::from_secs(10));
    assert_eq!(config.upstream.bind.port(), 18001);
    assert_eq!(config.admin.bind.port(), 18002);
    assert_eq!(config.gossip.bind.port(), 18003);
    assert_eq!(
        config.gossip.advertise_addr.as_deref(),
        Some("10.1.2.3:18003")
    );
    assert_eq!(config.gossip.join.len(), 2);
    assert_eq!(config.gossip.interval, Duration::from_millis(500));
    assert!((config.gossip.suspicion_threshold - 6.5).abs() < f64::EPSILON);
    assert_eq!(config.gossip.node_expiry, Duration::from_secs(20));
    assert_eq!(config.gossip.compaction_threshold, 50);
    assert_eq!(config.auth.hmac_secret.as_deref(), Some("s3cret"));
    assert_eq!(config.grace_period, Duration::from_secs(3));
}

#[test]
fn missing_file_is_a_read_error() {
    let err = ServerConfig::load(std::path::Path::new("/nonexistent/piko.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[proxy\nbind = ").unwrap();
    let err = ServerConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}
