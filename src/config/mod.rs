//! Configuration management

use crate::transport::Backoff;
use crate::tunnel::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which end of the tunnel a process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accepts tunnel connections and dials the egress service
    Server,
    /// Accepts plaintext connections and dials the tunnel server
    Client,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Expected mode; a binary refuses a config written for the other end
    #[serde(default)]
    pub mode: Option<Mode>,
    /// Listen address
    #[serde(default)]
    pub ingress: String,
    /// Address to dial: the egress service (server) or the tunnel server (client)
    #[serde(default)]
    pub egress: String,
    /// Pre-shared secret
    #[serde(default)]
    pub key: String,
    /// Seconds a relay waits after one direction ends before closing both
    #[serde(default = "default_linger_secs")]
    pub linger_secs: u64,
    /// Session tuning
    #[serde(default)]
    pub session: SessionSettings,
    /// Dial retry policy
    #[serde(default)]
    pub dial: DialSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_linger_secs() -> u64 {
    1
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject configs that cannot run
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.ingress.is_empty() || self.egress.is_empty() {
            return Err(crate::Error::Config(
                "ingress and egress addresses are required".to_string(),
            ));
        }
        if self.key.is_empty() {
            return Err(crate::Error::Config(
                "a pre-shared key is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Relay linger as a duration
    pub fn linger(&self) -> Duration {
        Duration::from_secs(self.linger_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: None,
            ingress: String::new(),
            egress: String::new(),
            key: String::new(),
            linger_secs: default_linger_secs(),
            session: SessionSettings::default(),
            dial: DialSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Session tuning, see [`SessionConfig`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// NOP interval in seconds (0 disables keepalive)
    pub keepalive_interval_secs: u64,
    /// Idle timeout in seconds
    pub keepalive_timeout_secs: u64,
    /// Maximum plaintext bytes per data frame
    pub max_payload: usize,
    /// Inbound streams queued ahead of accept
    pub accept_backlog: usize,
    /// Seal data frame payloads
    pub encrypt_payload: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            keepalive_interval_secs: defaults
                .keepalive_interval
                .map(|interval| interval.as_secs())
                .unwrap_or(0),
            keepalive_timeout_secs: defaults.keepalive_timeout.as_secs(),
            max_payload: defaults.max_payload,
            accept_backlog: defaults.accept_backlog,
            encrypt_payload: defaults.encrypt_payload,
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            keepalive_interval: (settings.keepalive_interval_secs > 0)
                .then(|| Duration::from_secs(settings.keepalive_interval_secs)),
            keepalive_timeout: Duration::from_secs(settings.keepalive_timeout_secs),
            max_payload: settings.max_payload,
            accept_backlog: settings.accept_backlog,
            encrypt_payload: settings.encrypt_payload,
        }
    }
}

/// Dial retry policy, see [`Backoff`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialSettings {
    /// Attempts per dial, including the first
    pub max_attempts: u32,
    /// Delay after the first failure in milliseconds
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds
    pub max_delay_ms: u64,
    /// Random jitter bound in milliseconds
    pub jitter_ms: u64,
    /// Per-attempt connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for DialSettings {
    fn default() -> Self {
        let defaults = Backoff::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            jitter_ms: defaults.jitter.as_millis() as u64,
            connect_timeout_ms: 10_000,
        }
    }
}

impl DialSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl From<&DialSettings> for Backoff {
    fn from(settings: &DialSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: Duration::from_millis(settings.jitter_ms),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Write an example configuration for `mode`, with a freshly generated key,
/// to a path that does not exist yet
pub fn write_example_config<P: AsRef<Path>>(
    mode: Mode,
    path: P,
) -> Result<Config, crate::Error> {
    let path = path.as_ref();
    if path.exists() {
        return Err(crate::Error::Config(format!(
            "Refusing to overwrite {}",
            path.display()
        )));
    }

    let mut config = generate_example_config(mode);
    config.key = crate::crypto::generate_key()?;
    config.save(path)?;
    Ok(config)
}

/// Generate example configuration
pub fn generate_example_config(mode: Mode) -> Config {
    let (ingress, egress) = match mode {
        Mode::Server => ("0.0.0.0:8443", "127.0.0.1:8080"),
        Mode::Client => ("127.0.0.1:1080", "tunnel.example.com:8443"),
    };
    Config {
        mode: Some(mode),
        ingress: ingress.to_string(),
        egress: egress.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config: Config = toml::from_str(
            r#"
            mode = "server"
            ingress = "0.0.0.0:8443"
            egress = "127.0.0.1:8080"
            key = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Some(Mode::Server));
        assert_eq!(config.linger(), Duration::from_secs(1));
        assert!(config.session.encrypt_payload);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_tables() {
        let config: Config = toml::from_str(
            r#"
            ingress = "127.0.0.1:1080"
            egress = "127.0.0.1:8443"
            key = "secret"
            linger_secs = 0

            [session]
            keepalive_interval_secs = 0
            max_payload = 4096

            [dial]
            max_attempts = 2
            jitter_ms = 0
            "#,
        )
        .unwrap();

        let session = SessionConfig::from(&config.session);
        assert!(session.keepalive_interval.is_none());
        assert_eq!(session.max_payload, 4096);
        assert_eq!(session.keepalive_timeout, Duration::from_secs(30));

        let backoff = Backoff::from(&config.dial);
        assert_eq!(backoff.max_attempts, 2);
        assert_eq!(backoff.jitter, Duration::ZERO);
        assert_eq!(backoff.base_delay, Duration::from_millis(200));
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut config = generate_example_config(Mode::Client);
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        config.key = "secret".to_string();
        assert!(config.validate().is_ok());

        config.egress.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_match_session_defaults() {
        let settings = SessionSettings::default();
        let converted = SessionConfig::from(&settings);
        let defaults = SessionConfig::default();

        assert_eq!(converted.keepalive_interval, defaults.keepalive_interval);
        assert_eq!(converted.keepalive_timeout, defaults.keepalive_timeout);
        assert_eq!(converted.max_payload, defaults.max_payload);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("veiltun-config-{}.toml", std::process::id()));
        let mut config = generate_example_config(Mode::Server);
        config.key = "secret".to_string();

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.mode, Some(Mode::Server));
        assert_eq!(loaded.ingress, config.ingress);
        assert_eq!(loaded.key, "secret");
    }

    #[test]
    fn test_write_example_config() {
        let path =
            std::env::temp_dir().join(format!("veiltun-example-{}.toml", std::process::id()));
        std::fs::remove_file(&path).ok();

        let written = write_example_config(Mode::Client, &path).unwrap();
        let loaded = Config::load(&path).unwrap();

        // A second write must not clobber the key
        let again = write_example_config(Mode::Client, &path);
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.mode, Some(Mode::Client));
        assert_eq!(loaded.key, written.key);
        assert!(loaded.validate().is_ok());
        assert!(matches!(again, Err(crate::Error::Config(_))));
    }
}
