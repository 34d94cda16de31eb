//! Configuration system for wxrelay
//!
//! Supports multiple configuration sources with the following precedence
//! (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (WXRELAY_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broker::BrokerConfig;
use crate::endpoint::{BridgeConfig, EndpointConfig};
use crate::error::{Error, Result};
use crate::protocol::Role;
use crate::provider::ProviderConfig;

/// Main relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Broker listener settings
    pub broker: BrokerSettings,

    /// Endpoint connection settings
    pub endpoint: EndpointSettings,

    /// Named-pipe bridge settings
    pub bridge: BridgeSettings,

    /// Weather provider settings
    pub provider: ProviderSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Broker listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Address to bind
    pub bind_addr: String,

    /// Port to listen on (0 = OS-assigned)
    pub port: u16,
}

/// Endpoint connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Broker host to connect to
    pub server_host: String,

    /// Broker port
    pub server_port: u16,

    /// Role token announced in the handshake (PROVIDER, CONSOLE, DEVICE)
    pub role: String,

    /// Maximum consecutive connect attempts before giving up
    pub max_connect_attempts: u32,

    /// Base retry delay in milliseconds; attempt N waits N times this
    pub retry_delay_ms: u64,

    /// Pause after a lost connection before retrying, in milliseconds
    pub reconnect_cooldown_ms: u64,

    /// Receive timeout per read call, in milliseconds
    pub receive_timeout_ms: u64,

    /// Connect call timeout, in milliseconds
    pub connect_timeout_ms: u64,
}

/// Named-pipe bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Directory holding both pipes
    pub pipe_dir: String,

    /// Command pipe file name
    pub command_pipe: String,

    /// Report pipe file name
    pub report_pipe: String,
}

/// Weather provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Weather API base URL
    pub api_base_url: String,

    /// Weather API key
    pub api_key: String,

    /// City queried until the console sends an update
    pub default_city: String,

    /// Response language code
    pub language: String,

    /// Temperature unit ("c" or "f")
    pub unit: String,

    /// Attempts per fetch before relaying an error text
    pub fetch_retries: u32,

    /// HTTP request timeout in seconds
    pub timeout_secs: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            endpoint: EndpointSettings::default(),
            bridge: BridgeSettings::default(),
            provider: ProviderSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 60000,
        }
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 60000,
            role: "DEVICE".to_string(),
            max_connect_attempts: 10,
            retry_delay_ms: 1000,
            reconnect_cooldown_ms: 2000,
            receive_timeout_ms: 5000,
            connect_timeout_ms: 10000,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            pipe_dir: "/tmp/wxrelay".to_string(),
            command_pipe: "command_fifo".to_string(),
            report_pipe: "weather_fifo".to_string(),
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.seniverse.com/v3".to_string(),
            api_key: String::new(),
            default_city: "guangzhou".to_string(),
            language: "zh-Hans".to_string(),
            unit: "c".to_string(),
            fetch_retries: 3,
            timeout_secs: 10,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
            config = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let expanded = shellexpand::tilde(path);
            let path = PathBuf::from(expanded.as_ref());
            if path.exists() {
                return Ok(Some(path));
            } else {
                return Err(Error::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("wxrelay.toml"),
            PathBuf::from("config.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("wxrelay").join("wxrelay.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".wxrelay").join("wxrelay.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/wxrelay/wxrelay.toml"),
        ];

        for path in &search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Broker settings
        if let Ok(val) = std::env::var("WXRELAY_BROKER_BIND") {
            self.broker.bind_addr = val;
        }
        if let Ok(val) = std::env::var("WXRELAY_BROKER_PORT") {
            if let Ok(n) = val.parse() {
                self.broker.port = n;
            }
        }

        // Endpoint settings
        if let Ok(val) = std::env::var("WXRELAY_SERVER_HOST") {
            self.endpoint.server_host = val;
        }
        if let Ok(val) = std::env::var("WXRELAY_SERVER_PORT") {
            if let Ok(n) = val.parse() {
                self.endpoint.server_port = n;
            }
        }
        if let Ok(val) = std::env::var("WXRELAY_ROLE") {
            self.endpoint.role = val;
        }
        if let Ok(val) = std::env::var("WXRELAY_MAX_CONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                self.endpoint.max_connect_attempts = n;
            }
        }
        if let Ok(val) = std::env::var("WXRELAY_RETRY_DELAY_MS") {
            if let Ok(n) = val.parse() {
                self.endpoint.retry_delay_ms = n;
            }
        }
        if let Ok(val) = std::env::var("WXRELAY_RECEIVE_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.endpoint.receive_timeout_ms = n;
            }
        }

        // Bridge settings
        if let Ok(val) = std::env::var("WXRELAY_PIPE_DIR") {
            self.bridge.pipe_dir = val;
        }

        // Provider settings
        if let Ok(val) = std::env::var("WXRELAY_API_URL") {
            self.provider.api_base_url = val;
        }
        if let Ok(val) = std::env::var("WXRELAY_API_KEY") {
            self.provider.api_key = val;
        }
        if let Ok(val) = std::env::var("WXRELAY_CITY") {
            self.provider.default_city = val;
        }

        // Logging settings
        if let Ok(val) = std::env::var("WXRELAY_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("WXRELAY_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("WXRELAY_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.bridge.pipe_dir = expand_path(&self.bridge.pipe_dir);

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.broker.bind_addr.is_empty() {
            return Err(Error::config_field_invalid(
                "broker.bind_addr",
                "bind address cannot be empty",
            ));
        }

        if self.endpoint.server_host.is_empty() {
            return Err(Error::config_field_invalid(
                "endpoint.server_host",
                "server host cannot be empty",
            ));
        }
        if self.endpoint.server_port == 0 {
            return Err(Error::config_field_invalid(
                "endpoint.server_port",
                "server port cannot be 0",
            ));
        }
        if Role::from_token(&self.endpoint.role).is_none() {
            return Err(Error::config_field_invalid(
                "endpoint.role",
                format!(
                    "unknown role token '{}'; must contain PROVIDER, CONSOLE or DEVICE",
                    self.endpoint.role
                ),
            ));
        }
        if self.endpoint.max_connect_attempts == 0 {
            return Err(Error::config_field_invalid(
                "endpoint.max_connect_attempts",
                "at least one connect attempt is required",
            ));
        }
        if self.endpoint.receive_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "endpoint.receive_timeout_ms",
                "receive timeout cannot be 0",
            ));
        }

        if self.bridge.command_pipe.is_empty() || self.bridge.report_pipe.is_empty() {
            return Err(Error::config_field_invalid(
                "bridge",
                "pipe file names cannot be empty",
            ));
        }

        if self.provider.fetch_retries == 0 {
            return Err(Error::config_field_invalid(
                "provider.fetch_retries",
                "at least one fetch attempt is required",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Conversions to runtime configs
    // ─────────────────────────────────────────────────────────────

    /// Broker runtime configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.broker.bind_addr.clone(),
            port: self.broker.port,
        }
    }

    /// Endpoint runtime configuration. The role defaults to the configured
    /// token; role-specific entry points override it.
    pub fn endpoint_config(&self) -> EndpointConfig {
        use std::time::Duration;

        EndpointConfig {
            server_host: self.endpoint.server_host.clone(),
            server_port: self.endpoint.server_port,
            // Validated in validate(); fall back defensively anyway
            role: Role::from_token(&self.endpoint.role).unwrap_or(Role::Device),
            max_connect_attempts: self.endpoint.max_connect_attempts,
            retry_delay: Duration::from_millis(self.endpoint.retry_delay_ms),
            reconnect_cooldown: Duration::from_millis(self.endpoint.reconnect_cooldown_ms),
            receive_timeout: Duration::from_millis(self.endpoint.receive_timeout_ms),
            connect_timeout: Duration::from_millis(self.endpoint.connect_timeout_ms),
        }
    }

    /// Bridge runtime configuration
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            pipe_dir: PathBuf::from(&self.bridge.pipe_dir),
            command_pipe: self.bridge.command_pipe.clone(),
            report_pipe: self.bridge.report_pipe.clone(),
        }
    }

    /// Provider runtime configuration
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            api_base_url: self.provider.api_base_url.clone(),
            api_key: self.provider.api_key.clone(),
            default_city: self.provider.default_city.clone(),
            language: self.provider.language.clone(),
            unit: self.provider.unit.clone(),
            fetch_retries: self.provider.fetch_retries,
            timeout_secs: self.provider.timeout_secs,
        }
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<()> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".wxrelay")
                .join("wxrelay.toml")
        });

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
    }

    // Generate default config with comments
    let config_content = generate_default_config();

    // Write the file
    fs::write(&config_path, config_content)
        .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

    println!("Configuration file created: {}", config_path.display());
    Ok(())
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# wxrelay Configuration
# https://github.com/wxrelay/wxrelay

[broker]
# Address to bind the relay broker
bind_addr = "0.0.0.0"

# Port to listen on (0 = OS-assigned)
port = 60000

[endpoint]
# Broker address clients connect to
server_host = "127.0.0.1"
server_port = 60000

# Role announced in the handshake: PROVIDER, CONSOLE or DEVICE
role = "DEVICE"

# Maximum consecutive connect attempts before giving up
max_connect_attempts = 10

# Base retry delay in milliseconds; attempt N waits N times this
retry_delay_ms = 1000

# Pause after a lost connection before retrying (milliseconds)
reconnect_cooldown_ms = 2000

# Receive timeout per read call (milliseconds)
receive_timeout_ms = 5000

# Connect call timeout (milliseconds)
connect_timeout_ms = 10000

[bridge]
# Directory holding both named pipes
pipe_dir = "/tmp/wxrelay"

# Pipe file names
command_pipe = "command_fifo"
report_pipe = "weather_fifo"

[provider]
# Weather API base URL
api_base_url = "https://api.seniverse.com/v3"

# Weather API key
api_key = ""

# City queried until the console sends an update
default_city = "guangzhou"

# Response language and temperature unit
language = "zh-Hans"
unit = "c"

# Attempts per fetch before relaying an error text
fetch_retries = 3

# HTTP request timeout in seconds
timeout_secs = 10

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.wxrelay/logs/wxrelay.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.broker.port, 60000);
        assert_eq!(config.endpoint.role, "DEVICE");
        assert_eq!(config.endpoint.max_connect_attempts, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_override() {
        env::set_var("WXRELAY_SERVER_HOST", "10.1.2.3");
        env::set_var("WXRELAY_ROLE", "CONSOLE");
        env::set_var("WXRELAY_LOG_LEVEL", "debug");

        let mut config = RelayConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.endpoint.server_host, "10.1.2.3");
        assert_eq!(config.endpoint.role, "CONSOLE");
        assert_eq!(config.logging.level, "debug");

        env::remove_var("WXRELAY_SERVER_HOST");
        env::remove_var("WXRELAY_ROLE");
        env::remove_var("WXRELAY_LOG_LEVEL");
    }

    #[test]
    fn test_validation_unknown_role() {
        let mut config = RelayConfig::default();
        config.endpoint.role = "CLIENT_X".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_retry_budget() {
        let mut config = RelayConfig::default();
        config.endpoint.max_connect_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = RelayConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_valid_config() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_path_expansion() {
        let mut config = RelayConfig::default();
        config.bridge.pipe_dir = "~/test/pipes".to_string();
        config.expand_paths();

        assert!(!config.bridge.pipe_dir.contains('~'));
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = RelayConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: RelayConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.broker.port, parsed.broker.port);
        assert_eq!(config.endpoint.role, parsed.endpoint.role);
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[broker]
bind_addr = "127.0.0.1"
port = 61000

[endpoint]
server_host = "broker.lan"
role = "PROVIDER"
max_connect_attempts = 5

[provider]
default_city = "shanghai"

[logging]
level = "debug"
"#;

        let config: RelayConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.broker.bind_addr, "127.0.0.1");
        assert_eq!(config.broker.port, 61000);
        assert_eq!(config.endpoint.server_host, "broker.lan");
        assert_eq!(config.endpoint.role, "PROVIDER");
        assert_eq!(config.endpoint.max_connect_attempts, 5);
        // Unspecified fields keep their defaults
        assert_eq!(config.endpoint.server_port, 60000);
        assert_eq!(config.provider.default_city, "shanghai");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_endpoint_config_conversion() {
        use std::time::Duration;

        let mut config = RelayConfig::default();
        config.endpoint.role = "CONSOLE".to_string();
        config.endpoint.retry_delay_ms = 250;

        let ep = config.endpoint_config();
        assert_eq!(ep.role, Role::Console);
        assert_eq!(ep.retry_delay, Duration::from_millis(250));
        assert_eq!(ep.server_addr(), "127.0.0.1:60000");
    }

    #[test]
    fn test_generated_default_config_parses() {
        let content = generate_default_config();
        let parsed: RelayConfig = toml::from_str(&content).unwrap();
        assert!(parsed.validate().is_ok());
    }
}
