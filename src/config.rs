//! File configuration.
//!
//! Every field has a default, a missing section or key falls back to it. Command line
//! flags are applied on top by the binary.

use crate::crypto::SharedKey;
use crate::error::{Error, Result};
use crate::punch::{PunchConfig, ScanConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[cfg(feature = "client")]
use crate::rendezvous::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub stun: StunSection,
    pub client: ClientSection,
    pub scan: ScanSection,
    /// Pre-shared key, 64 hex digits.
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub use_https: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            use_https: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunSection {
    /// STUN servers as `host:port`.
    pub servers: Vec<String>,
    /// HTTP address echo urls, asked only when no STUN server answers.
    pub echo: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for StunSection {
    fn default() -> Self {
        Self {
            servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
                "stun.cloudflare.com:3478".to_string(),
            ],
            echo: vec![
                "https://api.ipify.org".to_string(),
                "https://icanhazip.com".to_string(),
                "https://ifconfig.me/ip".to_string(),
            ],
            timeout_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub bind_addr: SocketAddr,
    pub keepalive_interval_secs: u64,
    pub punch_timeout_secs: u64,
    pub punch_burst: u32,
    pub punch_burst_gap_ms: u64,
    pub punch_interval_ms: u64,
    pub punch_max_interval_ms: u64,
    pub cgnat_mode: bool,
    pub recv_timeout_ms: u64,
    pub register_attempts: u32,
    pub register_retry_delay_secs: u64,
    pub resolve_attempts: u32,
    pub resolve_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            keepalive_interval_secs: 25,
            punch_timeout_secs: 30,
            punch_burst: 5,
            punch_burst_gap_ms: 50,
            punch_interval_ms: 2000,
            punch_max_interval_ms: 8000,
            cgnat_mode: false,
            recv_timeout_ms: 500,
            register_attempts: 3,
            register_retry_delay_secs: 2,
            resolve_attempts: 30,
            resolve_interval_secs: 2,
            refresh_interval_secs: 240,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSection {
    pub first_port: u16,
    pub last_port: u16,
    pub batch_size: u16,
    pub settle_ms: u64,
    pub listen_port: u16,
    pub beacon_interval_ms: u64,
}

impl Default for ScanSection {
    fn default() -> Self {
        let scan = ScanConfig::default();
        Self {
            first_port: scan.first_port,
            last_port: scan.last_port,
            batch_size: scan.batch_size,
            settle_ms: scan.settle.as_millis() as u64,
            listen_port: scan.listen_port,
            beacon_interval_ms: scan.beacon_interval.as_millis() as u64,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let scan = &self.scan;
        if scan.first_port == 0 {
            return Err(Error::Config("scan.first_port must be at least 1".into()));
        }
        if scan.first_port > scan.last_port {
            return Err(Error::Config(format!(
                "scan range {}-{} is inverted",
                scan.first_port, scan.last_port
            )));
        }
        if scan.batch_size == 0 {
            return Err(Error::Config("scan.batch_size must be positive".into()));
        }

        let c = &self.client;
        for (name, value) in [
            ("client.keepalive_interval_secs", c.keepalive_interval_secs),
            ("client.punch_timeout_secs", c.punch_timeout_secs),
            ("client.punch_interval_ms", c.punch_interval_ms),
            ("client.recv_timeout_ms", c.recv_timeout_ms),
            ("client.refresh_interval_secs", c.refresh_interval_secs),
            ("client.request_timeout_secs", c.request_timeout_secs),
            ("scan.beacon_interval_ms", scan.beacon_interval_ms),
            ("stun.timeout_secs", self.stun.timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        if c.punch_burst == 0 {
            return Err(Error::Config("client.punch_burst must be positive".into()));
        }
        if let Some(url) = self.stun.servers.iter().find(|s| s.contains("://")) {
            return Err(Error::Config(format!(
                "stun server {:?} is a url, address echo urls belong in stun.echo",
                url
            )));
        }
        if let Some(server) = self.stun.servers.iter().find(|s| !s.contains(':')) {
            return Err(Error::Config(format!(
                "stun server {:?} needs a port, as in host:3478",
                server
            )));
        }
        if self.server.host.trim().is_empty() {
            return Err(Error::Config("server.host is empty".into()));
        }

        Ok(())
    }

    /// Base url of the rendezvous server, the port is left out when it is the
    /// scheme default.
    pub fn server_url(&self) -> String {
        let server = &self.server;
        let (scheme, default_port) = if server.use_https {
            ("https", 443)
        } else {
            ("http", 80)
        };

        let host = if server.host.contains(':') && !server.host.starts_with('[') {
            format!("[{}]", server.host)
        } else {
            server.host.clone()
        };

        if server.port == default_port {
            format!("{}://{}", scheme, host)
        } else {
            format!("{}://{}:{}", scheme, host, server.port)
        }
    }

    pub fn punch(&self) -> PunchConfig {
        let c = &self.client;
        let s = &self.scan;
        PunchConfig {
            burst: c.punch_burst,
            burst_gap: Duration::from_millis(c.punch_burst_gap_ms),
            interval: Duration::from_millis(c.punch_interval_ms),
            max_interval: Duration::from_millis(c.punch_max_interval_ms),
            timeout: Duration::from_secs(c.punch_timeout_secs),
            aggressive: c.cgnat_mode,
            scan: ScanConfig {
                first_port: s.first_port,
                last_port: s.last_port,
                batch_size: s.batch_size,
                settle: Duration::from_millis(s.settle_ms),
                listen_port: s.listen_port,
                beacon_interval: Duration::from_millis(s.beacon_interval_ms),
            },
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.client.keepalive_interval_secs)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.client.recv_timeout_ms)
    }

    pub fn stun_timeout(&self) -> Duration {
        Duration::from_secs(self.stun.timeout_secs)
    }

    #[cfg(feature = "client")]
    pub fn retry(&self) -> RetryPolicy {
        let c = &self.client;
        RetryPolicy {
            register_attempts: c.register_attempts,
            register_delay: Duration::from_secs(c.register_retry_delay_secs),
            resolve_attempts: c.resolve_attempts,
            resolve_interval: Duration::from_secs(c.resolve_interval_secs),
            refresh_period: Duration::from_secs(c.refresh_interval_secs),
            request_timeout: Duration::from_secs(c.request_timeout_secs),
        }
    }

    /// The configured pre-shared key.
    pub fn key(&self) -> Result<SharedKey> {
        match &self.key {
            Some(hex) => SharedKey::from_hex(hex),
            None => Err(Error::InvalidKey("no key configured".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        c.validate().unwrap();

        assert_eq!(c.server_url(), "http://127.0.0.1:5000");
        assert_eq!(c.stun.servers[0], "stun.l.google.com:19302");
        assert_eq!(c.stun.echo.len(), 3);
        assert_eq!(c.stun_timeout(), Duration::from_secs(3));

        let p = c.punch();
        assert_eq!(p.burst, 5);
        assert_eq!(p.burst_gap, Duration::from_millis(50));
        assert_eq!(p.timeout, Duration::from_secs(30));
        assert!(!p.aggressive);
        assert_eq!(p.scan.ports(), 10000..=65535);
        assert_eq!(p.scan.settle, Duration::from_millis(500));
        assert_eq!(c.keepalive(), Duration::from_secs(25));
    }

    #[cfg(feature = "client")]
    #[test]
    fn test_retry_policy() {
        let r = Config::default().retry();
        assert_eq!(r.register_attempts, 3);
        assert_eq!(r.resolve_attempts, 30);
        assert_eq!(r.refresh_period, Duration::from_secs(240));
    }

    #[test]
    fn test_partial_file() {
        let c: Config = serde_json::from_str(
            r#"{
                "server": {"host": "rdv.example.com", "port": 443, "use_https": true},
                "client": {"cgnat_mode": true},
                "key": "00"
            }"#,
        )
        .unwrap();

        assert_eq!(c.server_url(), "https://rdv.example.com");
        assert!(c.punch().aggressive);
        assert_eq!(c.client.punch_burst, 5);
        assert_eq!(c.scan.batch_size, 200);
        assert!(matches!(c.key(), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_server_url() {
        let mut c = Config::default();
        c.server.port = 80;
        assert_eq!(c.server_url(), "http://127.0.0.1");

        c.server.use_https = true;
        assert_eq!(c.server_url(), "https://127.0.0.1:80");

        c.server.host = "::1".to_string();
        c.server.port = 8443;
        assert_eq!(c.server_url(), "https://[::1]:8443");
    }

    #[test]
    fn test_validate() {
        let mut c = Config::default();
        c.scan.first_port = 2000;
        c.scan.last_port = 1999;
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = Config::default();
        c.scan.first_port = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.scan.batch_size = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.client.punch_interval_ms = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.scan.first_port = 7000;
        c.scan.last_port = 7000;
        c.validate().unwrap();
        assert_eq!(c.punch().scan.port_count(), 1);
    }

    #[test]
    fn test_stun_servers() {
        let c: Config = serde_json::from_str(
            r#"{"stun": {"servers": ["stun.example.net:3478", "[2001:db8::1]:3478"]}}"#,
        )
        .unwrap();
        c.validate().unwrap();
        assert_eq!(c.stun.echo, StunSection::default().echo);

        let mut c = Config::default();
        c.stun.servers = vec!["https://api.ipify.org".to_string()];
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        c.stun.servers = vec!["stun.example.net".to_string()];
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.stun.timeout_secs = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_key() {
        let key = SharedKey::generate();
        let c = Config {
            key: Some(key.to_hex()),
            ..Config::default()
        };
        assert_eq!(c.key().unwrap().as_bytes(), key.as_bytes());
        assert!(Config::default().key().is_err());
    }

    #[test]
    fn test_load() {
        let path = std::env::temp_dir().join(format!("rndz-chat-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"scan": {"first_port": 9, "last_port": 3}}"#).unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, r#"{"scan": {"first_port": 3, "last_port": 9}}"#).unwrap();
        assert_eq!(Config::load(&path).unwrap().punch().scan.port_count(), 7);

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Io(_))));
    }
}
