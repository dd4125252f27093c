//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `RACETEL_DEVICE`, `RACETEL_SK`
//! 2. **Config file** — path via `--config <path>`, or `racetel.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! data_dir = "/var/lib/racetel"
//!
//! [modem]
//! device = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [bearer]
//! apn = "internet"
//!
//! [endpoints]
//! reset_request = "http://tele.example.com/session/reset"
//! packet_essentials = "http://tele.example.com/packet/essentials"
//! packet_full = "http://tele.example.com/packet/full"
//!
//! [identity]
//! sk = "<64 hex chars of the P-256 scalar>"
//! user_agent = "racetel"
//!
//! [uplink]
//! batch_size = 10
//! http_timeout_decis = 600
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub bearer: BearerConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub uplink: UplinkSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Host-side service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Directory for persistent data (the post-mortem record).
    /// Default `/var/lib/racetel`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Modem serial port settings. The port runs raw 8N1 at the configured rate.
#[derive(Debug, Clone, Deserialize)]
pub struct ModemConfig {
    /// Serial device path. Override with `RACETEL_DEVICE`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Line rate in bits/s (default 115200, the SIM800 autobaud lock-in).
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Cellular bearer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BearerConfig {
    /// Access point name handed to the modem (default `internet`).
    #[serde(default = "default_apn")]
    pub apn: String,
}

/// Backend endpoints, all plain HTTP relative to the modem's HTTP stack.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_reset_request")]
    pub reset_request: String,
    #[serde(default = "default_packet_essentials")]
    pub packet_essentials: String,
    #[serde(default = "default_packet_full")]
    pub packet_full: String,
}

/// Device identity and signing material.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// P-256 private scalar, 64 hex characters. Override with `RACETEL_SK`.
    /// The default is a placeholder that triggers a startup warning.
    #[serde(default = "default_sk")]
    pub sk: String,
    /// User agent reported through `AT+HTTPPARA="UA"`.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Upload FSM knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkSection {
    /// Packets drained per upload batch (default 10).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// `+HTTPACTION` wait budget in deciseconds (default 600 = 60 s).
    #[serde(default = "default_http_timeout_decis")]
    pub http_timeout_decis: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> String {
    "/var/lib/racetel".to_string()
}
fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud() -> u32 {
    115_200
}
fn default_apn() -> String {
    "internet".to_string()
}
fn default_reset_request() -> String {
    "http://tele.example.com/session/reset".to_string()
}
fn default_packet_essentials() -> String {
    "http://tele.example.com/packet/essentials".to_string()
}
fn default_packet_full() -> String {
    "http://tele.example.com/packet/full".to_string()
}
fn default_sk() -> String {
    "change-me".to_string()
}
fn default_user_agent() -> String {
    "racetel".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_http_timeout_decis() -> usize {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
        }
    }
}

impl Default for BearerConfig {
    fn default() -> Self {
        Self { apn: default_apn() }
    }
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            reset_request: default_reset_request(),
            packet_essentials: default_packet_essentials(),
            packet_full: default_packet_full(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            sk: default_sk(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for UplinkSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            http_timeout_decis: default_http_timeout_decis(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            modem: ModemConfig::default(),
            bearer: BearerConfig::default(),
            endpoints: EndpointsConfig::default(),
            identity: IdentityConfig::default(),
            uplink: UplinkSection::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `racetel.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("racetel.toml").exists() {
            let content =
                std::fs::read_to_string("racetel.toml").expect("Failed to read racetel.toml");
            toml::from_str(&content).expect("Failed to parse racetel.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(device) = std::env::var("RACETEL_DEVICE") {
            config.modem.device = device;
        }
        if let Ok(sk) = std::env::var("RACETEL_SK") {
            config.identity.sk = sk;
        }

        config
    }

    /// Collect configuration problems worth refusing to start over.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.modem.device.is_empty() {
            errors.push("[modem].device must not be empty".to_string());
        }
        if !crate::uart::SUPPORTED_BAUDS.contains(&self.modem.baud) {
            errors.push(format!(
                "[modem].baud: unsupported rate {} (supported: {:?})",
                self.modem.baud,
                crate::uart::SUPPORTED_BAUDS
            ));
        }
        for (name, url) in [
            ("reset_request", &self.endpoints.reset_request),
            ("packet_essentials", &self.endpoints.packet_essentials),
            ("packet_full", &self.endpoints.packet_full),
        ] {
            if url.is_empty() {
                errors.push(format!("[endpoints].{name} must not be empty"));
            }
        }
        if self.uplink.batch_size == 0 {
            errors.push("[uplink].batch_size must be at least 1".to_string());
        }

        if self.identity.sk != default_sk() {
            if let Err(e) = self.signing_key() {
                errors.push(format!("[identity].sk: {e}"));
            }
        }

        errors
    }

    /// Parse the configured hex scalar into a signing key.
    pub fn signing_key(&self) -> Result<p256::ecdsa::SigningKey, String> {
        if self.identity.sk.len() != 64 {
            return Err(format!(
                "expected 64 hex chars, got {}",
                self.identity.sk.len()
            ));
        }
        let bytes = hex::decode(&self.identity.sk).map_err(|e| format!("bad hex: {e}"))?;
        p256::ecdsa::SigningKey::from_slice(&bytes).map_err(|e| format!("bad scalar: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_coherent() {
        let config = Config::default();
        assert_eq!(config.bearer.apn, "internet");
        assert_eq!(config.uplink.batch_size, 10);
        assert_eq!(config.uplink.http_timeout_decis, 600);
        assert!(config.endpoints.reset_request.starts_with("http://"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [modem]
            device = "/dev/ttyS2"

            [bearer]
            apn = "race.apn"
            "#,
        )
        .unwrap();
        assert_eq!(config.modem.device, "/dev/ttyS2");
        assert_eq!(config.modem.baud, 115_200);
        assert_eq!(config.bearer.apn, "race.apn");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_odd_baud() {
        let mut config = Config::default();
        config.modem.baud = 12_345;
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("[modem].baud")));
    }

    #[test]
    fn test_validate_catches_bad_key() {
        let mut config = Config::default();
        config.identity.sk = "zz".repeat(32);
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("[identity].sk")));
    }

    #[test]
    fn test_validate_accepts_good_key() {
        let mut config = Config::default();
        config.identity.sk = "17".repeat(32);
        assert!(config.validate().is_empty());
        assert!(config.signing_key().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.uplink.batch_size = 0;
        assert!(!config.validate().is_empty());
    }
}
