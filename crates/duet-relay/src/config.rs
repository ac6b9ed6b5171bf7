//! Configuration management

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use duet_proto::validation::sizes;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Shortest accepted HS256 secret, in bytes.
pub const MIN_JWT_SECRET_LEN: usize = 16;

/// Server configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// `:memory:` keeps everything in process memory.
    pub database_path: PathBuf,
    pub jwt_secret: String,
    pub max_ciphertext_bytes: usize,
    /// Per-connection outbound queue; pushes beyond it are dropped.
    pub outbound_queue_len: usize,
    pub token_ttl_hours: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_path: PathBuf::from("duet-relay.db"),
            jwt_secret: String::new(),
            max_ciphertext_bytes: sizes::DEFAULT_MAX_CIPHERTEXT,
            outbound_queue_len: 64,
            token_ttl_hours: 24 * 7,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"<redacted>")
            .field("max_ciphertext_bytes", &self.max_ciphertext_bytes)
            .field("outbound_queue_len", &self.outbound_queue_len)
            .field("token_ttl_hours", &self.token_ttl_hours)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;

        if let Ok(config_path) = std::env::var("DUET_RELAY_CONFIG") {
            let content = std::fs::read_to_string(&config_path)?;
            config.apply_toml(&content)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply `DUET_RELAY_*` overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(addr) = lookup("DUET_RELAY_LISTEN_ADDR") {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr: {}", e)))?;
        }

        if let Some(path) = lookup("DUET_RELAY_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }

        if let Some(secret) = lookup("DUET_RELAY_JWT_SECRET") {
            self.jwt_secret = secret;
        }

        if let Some(max) = lookup("DUET_RELAY_MAX_CIPHERTEXT_BYTES") {
            self.max_ciphertext_bytes = max
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid max_ciphertext_bytes: {}", e)))?;
        }

        if let Some(len) = lookup("DUET_RELAY_OUTBOUND_QUEUE_LEN") {
            self.outbound_queue_len = len
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid outbound_queue_len: {}", e)))?;
        }

        Ok(())
    }

    /// Apply values from a TOML document. Unknown keys are ignored.
    pub fn apply_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let toml_config: toml::Value = toml::from_str(content)?;

        if let Some(addr) = toml_config.get("listen_addr").and_then(|v| v.as_str()) {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr in TOML: {}", e)))?;
        }

        if let Some(path) = toml_config.get("database_path").and_then(|v| v.as_str()) {
            self.database_path = PathBuf::from(path);
        }

        if let Some(secret) = toml_config.get("jwt_secret").and_then(|v| v.as_str()) {
            self.jwt_secret = secret.to_string();
        }

        if let Some(max) = toml_config.get("max_ciphertext_bytes").and_then(|v| v.as_integer()) {
            self.max_ciphertext_bytes = non_negative("max_ciphertext_bytes", max)?;
        }

        if let Some(len) = toml_config.get("outbound_queue_len").and_then(|v| v.as_integer()) {
            self.outbound_queue_len = non_negative("outbound_queue_len", len)?;
        }

        if let Some(ttl) = toml_config.get("token_ttl_hours").and_then(|v| v.as_integer()) {
            self.token_ttl_hours = non_negative("token_ttl_hours", ttl)? as u64;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "jwt_secret must be at least {} bytes",
                MIN_JWT_SECRET_LEN
            )));
        }

        if self.max_ciphertext_bytes < sizes::TAG_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_ciphertext_bytes must be >= {}",
                sizes::TAG_SIZE
            )));
        }

        if self.outbound_queue_len == 0 {
            return Err(ConfigError::Invalid("outbound_queue_len must be > 0".to_string()));
        }

        if self.token_ttl_hours == 0 {
            return Err(ConfigError::Invalid("token_ttl_hours must be > 0".to_string()));
        }

        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_hours * 3600)
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == ":memory:"
    }
}

fn non_negative(field: &str, value: i64) -> Result<usize, ConfigError> {
    usize::try_from(value).map_err(|_| ConfigError::Invalid(format!("{} must be >= 0", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> ServerConfig {
        ServerConfig {
            jwt_secret: "0123456789abcdef0123".to_string(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn default_needs_a_secret() {
        assert!(ServerConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DUET_RELAY_LISTEN_ADDR", "127.0.0.1:9000"),
            ("DUET_RELAY_DATABASE_PATH", ":memory:"),
            ("DUET_RELAY_OUTBOUND_QUEUE_LEN", "8"),
        ]
        .into_iter()
        .collect();
        let mut config = valid();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert!(config.is_in_memory());
        assert_eq!(config.outbound_queue_len, 8);
    }

    #[test]
    fn bad_env_value_is_rejected() {
        let mut config = valid();
        let err = config
            .apply_env(|k| (k == "DUET_RELAY_MAX_CIPHERTEXT_BYTES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn toml_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_toml(
                r#"
                listen_addr = "127.0.0.1:7000"
                jwt_secret = "a-much-longer-test-secret"
                max_ciphertext_bytes = 1024
                token_ttl_hours = 2
                "#,
            )
            .unwrap();
        assert_eq!(config.listen_addr.port(), 7000);
        assert_eq!(config.max_ciphertext_bytes, 1024);
        assert_eq!(config.token_ttl(), Duration::from_secs(7200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_invalid() {
        let mut config = valid();
        config.outbound_queue_len = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.max_ciphertext_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        assert!(config.apply_toml("outbound_queue_len = -1").is_err());
    }

    #[test]
    fn debug_hides_secret() {
        let rendered = format!("{:?}", valid());
        assert!(!rendered.contains("0123456789abcdef"));
    }
}
