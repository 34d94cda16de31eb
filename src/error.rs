//! Error types for wxrelay
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 302,
    RetryBudgetExhausted = 310,

    // Protocol errors (4xx)
    HandshakeRejected = 400,
    ProtocolMalformed = 401,

    // Bridge/resource errors (5xx)
    PipeCreate = 500,
    PipeOpen = 501,
    PipeWrite = 502,

    // Provider errors (6xx)
    WeatherFetchFailed = 600,
    WeatherParseFailed = 601,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Bridge errors
            600..=699 => 60, // Provider errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection failed
    #[error("Failed to connect to {addr}: {message}")]
    ConnectionFailed { addr: String, message: String },

    /// Connection timeout
    #[error("Connection to {addr} timed out after {timeout_secs}s")]
    ConnectionTimeout { addr: String, timeout_secs: u64 },

    /// Connection lost
    #[error("Lost connection to broker: {message}")]
    ConnectionLost { message: String },

    /// Reconnect budget exhausted; the endpoint is in its terminal error state
    #[error("Gave up reconnecting after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },

    /// Generic connection error
    #[error("Connection error: {0}")]
    Connection(String),

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Handshake carried an unrecognized role token
    #[error("Handshake rejected: unrecognized role token {token:?}")]
    HandshakeRejected { token: String },

    /// Generic protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    // ─────────────────────────────────────────────────────────────
    // Bridge Errors
    // ─────────────────────────────────────────────────────────────

    /// Named pipe creation failed
    #[error("Failed to create pipe {path}: {message}")]
    PipeCreate { path: PathBuf, message: String },

    /// Named pipe could not be opened
    #[error("Failed to open pipe {path}: {message}")]
    PipeOpen { path: PathBuf, message: String },

    /// Named pipe write failed
    #[error("Failed to write to pipe {path}: {message}")]
    PipeWrite { path: PathBuf, message: String },

    // ─────────────────────────────────────────────────────────────
    // Provider Errors
    // ─────────────────────────────────────────────────────────────

    /// Weather API request failed
    #[error("Weather fetch for {city:?} failed: {message}")]
    WeatherFetch { city: String, message: String },

    /// Weather API response did not contain the expected fields
    #[error("Weather response malformed: {message}")]
    WeatherParse { message: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            Error::RetryBudgetExhausted { .. } => ErrorCode::RetryBudgetExhausted,
            Error::Connection(_) => ErrorCode::ConnectionFailed,

            Error::HandshakeRejected { .. } => ErrorCode::HandshakeRejected,
            Error::Protocol(_) => ErrorCode::ProtocolMalformed,

            Error::PipeCreate { .. } => ErrorCode::PipeCreate,
            Error::PipeOpen { .. } => ErrorCode::PipeOpen,
            Error::PipeWrite { .. } => ErrorCode::PipeWrite,

            Error::WeatherFetch { .. } => ErrorCode::WeatherFetchFailed,
            Error::WeatherParse { .. } => ErrorCode::WeatherParseFailed,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::ConnectionLost { .. }
                | Error::Connection(_)
                | Error::Io(_)
                | Error::IoRead { .. }
                | Error::IoWrite { .. }
                | Error::WeatherFetch { .. }
        )
    }

    /// Check if the error is fatal (the process should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::RetryBudgetExhausted { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'wxrelay config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'wxrelay config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::ConnectionFailed { .. } => Some(
                "Check that the broker is running and the server address in config is correct."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The broker may be down or unreachable. Check your firewall settings."
            ),
            Error::ConnectionLost { .. } => Some(
                "Connection was interrupted. The endpoint will automatically attempt to reconnect."
            ),
            Error::RetryBudgetExhausted { .. } => Some(
                "The broker stayed unreachable for every retry. Restart the endpoint once the broker is back."
            ),

            Error::HandshakeRejected { .. } => Some(
                "The role token must contain PROVIDER, CONSOLE or DEVICE."
            ),

            Error::PipeCreate { .. } | Error::PipeOpen { .. } => Some(
                "Check that the pipe directory in [bridge] exists and is writable."
            ),

            Error::WeatherFetch { .. } => Some(
                "Check your internet connection and the [provider] api_key setting."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            addr: addr.into(),
            message: message.into(),
        }
    }

    /// Create a connection timeout error
    pub fn connection_timeout(addr: impl Into<String>, timeout_secs: u64) -> Self {
        Error::ConnectionTimeout {
            addr: addr.into(),
            timeout_secs,
        }
    }

    /// Create a handshake rejection for an unrecognized token
    pub fn handshake_rejected(token: impl Into<String>) -> Self {
        Error::HandshakeRejected {
            token: token.into(),
        }
    }

    /// Create a pipe open error
    pub fn pipe_open(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::PipeOpen {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a weather fetch error
    pub fn weather_fetch(city: impl Into<String>, message: impl Into<String>) -> Self {
        Error::WeatherFetch {
            city: city.into(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
