//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via FLAPWIRE_CONFIG or --config)
//! 3. Environment variables

use flapwire_protocol::auth::ClientVersionInfo;
use flapwire_protocol::{DEFAULT_LOGIN_HOST, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sign-on host and client identification.
    pub login: LoginConfig,
    /// Outbound proxy.
    pub proxy: ProxyConfig,
    /// Peer connection timeouts and relay.
    pub rendezvous: RendezvousConfig,
    /// Rate limiting.
    pub rate: RateConfig,
    /// Frame transport.
    pub transport: TransportConfig,
    /// TLS for the server connections.
    pub tls: TlsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("FLAPWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.login.apply_env_overrides();
        self.proxy.apply_env_overrides();
        self.rendezvous.apply_env_overrides();
        self.transport.apply_env_overrides();
        self.tls.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.login.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "login.host must not be empty".to_string(),
            ));
        }
        if self.login.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "login.timeout_secs must be > 0".to_string(),
            ));
        }
        if self.proxy.kind != ProxyKind::None && self.proxy.host.is_none() {
            return Err(ConfigError::ValidationError(format!(
                "proxy.kind is {:?} but proxy.host is not set",
                self.proxy.kind
            )));
        }
        let rv = &self.rendezvous;
        for (name, value) in [
            ("lan_timeout_ms", rv.lan_timeout_ms),
            ("internet_timeout_ms", rv.internet_timeout_ms),
            ("proxy_timeout_ms", rv.proxy_timeout_ms),
            ("ack_timeout_ms", rv.ack_timeout_ms),
            ("stall_timeout_ms", rv.stall_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "rendezvous.{} must be > 0",
                    name
                )));
            }
        }
        if rv.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "rendezvous.chunk_size must be > 0".to_string(),
            ));
        }
        if self.transport.dispatch == DispatchMode::Queued && self.transport.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "transport.queue_capacity must be > 0 for queued dispatch".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sign-on configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub host: String,
    pub port: u16,
    /// Identification sent with the credentials.
    pub client_version: ClientVersionInfo,
    pub language: String,
    pub country: String,
    /// Seconds before an unanswered sign-on fails.
    pub timeout_secs: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_LOGIN_HOST.to_string(),
            port: DEFAULT_PORT,
            client_version: ClientVersionInfo::default(),
            language: "en".to_string(),
            country: "us".to_string(),
            timeout_secs: 15,
        }
    }
}

impl LoginConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("FLAPWIRE_LOGIN_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("FLAPWIRE_LOGIN_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }
        if let Ok(id) = std::env::var("FLAPWIRE_CLIENT_ID_STRING") {
            self.client_version.id_string = id;
        }
    }

    /// Returns the sign-on timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Outbound proxy type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    None,
    Socks4,
    Socks5,
    Http,
}

impl std::str::FromStr for ProxyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(ProxyKind::None),
            "socks4" => Ok(ProxyKind::Socks4),
            "socks5" => Ok(ProxyKind::Socks5),
            "http" => Ok(ProxyKind::Http),
            other => Err(ConfigError::ValidationError(format!(
                "unknown proxy kind '{}'",
                other
            ))),
        }
    }
}

/// Outbound proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            kind: ProxyKind::None,
            host: None,
            port: 1080,
            username: None,
            password: None,
        }
    }
}

impl ProxyConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(kind) = std::env::var("FLAPWIRE_PROXY_KIND") {
            match kind.parse() {
                Ok(parsed) => self.kind = parsed,
                Err(e) => tracing::warn!("ignoring FLAPWIRE_PROXY_KIND: {}", e),
            }
        }
        if let Ok(host) = std::env::var("FLAPWIRE_PROXY_HOST") {
            self.host = Some(host);
        }
        if let Ok(port) = std::env::var("FLAPWIRE_PROXY_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }
        if let Ok(user) = std::env::var("FLAPWIRE_PROXY_USERNAME") {
            self.username = Some(user);
        }
        if let Ok(password) = std::env::var("FLAPWIRE_PROXY_PASSWORD") {
            self.password = Some(password);
        }
    }
}

/// Peer connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Direct attempt timeout when the peer is on the same network.
    pub lan_timeout_ms: u64,
    /// Direct attempt timeout across the Internet.
    pub internet_timeout_ms: u64,
    /// Relay attempt timeout.
    pub proxy_timeout_ms: u64,
    /// How long the peer may take to accept a proposal.
    pub ack_timeout_ms: u64,
    /// Added to connection timeouts when the buddy started the session.
    pub buddy_initiated_bonus_ms: u64,
    pub relay_host: String,
    pub relay_port: u16,
    /// Fall back to the relay after direct attempts fail.
    pub allow_proxy: bool,
    /// Bytes moved per readiness signal.
    pub chunk_size: usize,
    /// A transfer with no progress for this long fails.
    pub stall_timeout_ms: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            lan_timeout_ms: 2_000,
            internet_timeout_ms: 3_000,
            proxy_timeout_ms: 10_000,
            ack_timeout_ms: 120_000,
            buddy_initiated_bonus_ms: 2_000,
            relay_host: "ars.oscar.aol.com".to_string(),
            relay_port: DEFAULT_PORT,
            allow_proxy: true,
            chunk_size: 8 * 1024,
            stall_timeout_ms: 30_000,
        }
    }
}

impl RendezvousConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("FLAPWIRE_RELAY_HOST") {
            self.relay_host = host;
        }
        if let Ok(port) = std::env::var("FLAPWIRE_RELAY_PORT") {
            if let Ok(parsed) = port.parse() {
                self.relay_port = parsed;
            }
        }
        if let Ok(allow) = std::env::var("FLAPWIRE_ALLOW_PROXY") {
            self.allow_proxy = allow.eq_ignore_ascii_case("true") || allow == "1";
        }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Safety margin added to a class limit, in milliseconds.
    pub error_margin_ms: u64,
    /// Per-class margin, keyed by class id.
    pub error_margin_overrides: HashMap<u16, u64>,
    /// Interval at which queues are re-checked for regained budget.
    pub pump_interval_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            error_margin_ms: 100,
            error_margin_overrides: HashMap::new(),
            pump_interval_ms: 100,
        }
    }
}

impl RateConfig {
    /// Margin for `class_id`, honouring overrides.
    pub fn error_margin(&self, class_id: u16) -> u64 {
        self.error_margin_overrides
            .get(&class_id)
            .copied()
            .unwrap_or(self.error_margin_ms)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms.max(1))
    }
}

/// How decoded frames reach listeners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// On the reader task itself.
    Inline,
    /// Through a bounded queue drained by a worker task.
    #[default]
    Queued,
}

/// Frame transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub dispatch: DispatchMode,
    /// Capacity of the dispatch queue.
    pub queue_capacity: usize,
    /// Keep-alive interval in seconds, 0 disables.
    pub keep_alive_secs: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchMode::Queued,
            queue_capacity: 256,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

impl TransportConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("FLAPWIRE_DISPATCH") {
            match mode.to_ascii_lowercase().as_str() {
                "inline" => self.dispatch = DispatchMode::Inline,
                "queued" => self.dispatch = DispatchMode::Queued,
                other => tracing::warn!("ignoring FLAPWIRE_DISPATCH={}", other),
            }
        }
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// TLS configuration for server connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Server name for SNI (defaults to the host being dialed).
    pub server_name: Option<String>,
    /// PEM CA bundle; the bundled web roots are used when unset.
    pub ca_cert_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("FLAPWIRE_TLS_ENABLED") {
            self.enabled = enabled.eq_ignore_ascii_case("true") || enabled == "1";
        }
        if let Ok(path) = std::env::var("FLAPWIRE_TLS_CA_CERT") {
            self.ca_cert_path = Some(PathBuf::from(path));
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.login.port, 5190);
        assert_eq!(config.login.timeout(), Duration::from_secs(15));
        assert_eq!(config.rendezvous.lan_timeout_ms, 2_000);
        assert_eq!(config.rendezvous.internet_timeout_ms, 3_000);
        assert_eq!(config.rendezvous.buddy_initiated_bonus_ms, 2_000);
        assert_eq!(config.proxy.kind, ProxyKind::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.rate.error_margin_overrides.insert(3, 250);
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.login.host, config.login.host);
        assert_eq!(parsed.rate.error_margin(3), 250);
        assert_eq!(parsed.rate.error_margin(1), 100);
    }

    #[test]
    fn test_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "proxy:\n  kind: socks5\n  host: 10.0.0.1\n  port: 9050\ntransport:\n  dispatch: inline"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.proxy.kind, ProxyKind::Socks5);
        assert_eq!(config.proxy.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(config.proxy.port, 9050);
        assert_eq!(config.transport.dispatch, DispatchMode::Inline);
        // untouched sections keep defaults
        assert_eq!(config.rendezvous.proxy_timeout_ms, 10_000);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/flapwire.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.proxy.kind = ProxyKind::Http;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.rendezvous.lan_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lan_timeout_ms"));
    }

    #[test]
    fn test_proxy_kind_parse() {
        assert_eq!("SOCKS4".parse::<ProxyKind>().unwrap(), ProxyKind::Socks4);
        assert!("gopher".parse::<ProxyKind>().is_err());
    }

    #[test]
    fn test_password_not_saved() {
        let mut config = Config::default();
        config.proxy.password = Some("hunter2".to_string());
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();
        let saved = std::fs::read_to_string(file.path()).unwrap();
        assert!(!saved.contains("hunter2"));
    }
}
