//! Error handling for the Proof-of-Indexing node
//!
//! One error type for every fallible operation in the node. Gossip
//! validation failures are [`crate::gossip::RejectReason`] values instead
//! and never reach callers.

use thiserror::Error;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the node
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Gossip protocol (wire format) errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Encoded message exceeds the frame limit
    #[error("Message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// Mining errors
    #[error("Mining error: {message}")]
    Mining { message: String },

    /// Target / difficulty errors
    #[error("Invalid target: {message}")]
    Target { message: String },

    /// Mempool errors
    #[error("Mempool error: {message}")]
    Mempool { message: String },

    /// Mint submission errors
    #[error("Mint error: {message}")]
    Mint { message: String },

    /// Cryptographic errors
    #[error("Cryptographic error: {message}")]
    Crypto { message: String },

    /// Network errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Cancellation errors for async operations
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// A node instance is already running in this process
    #[error("Node is already running")]
    AlreadyRunning,
}

macro_rules! message_constructors {
    ($($name:ident => $variant:ident { $field:ident }),* $(,)?) => {
        $(
            pub fn $name($field: impl Into<String>) -> Self {
                Self::$variant {
                    $field: $field.into(),
                }
            }
        )*
    };
}

impl Error {
    message_constructors! {
        config => Config { message },
        protocol => Protocol { message },
        mining => Mining { message },
        target => Target { message },
        mempool => Mempool { message },
        mint => Mint { message },
        crypto => Crypto { message },
        network => Network { message },
        timeout => Timeout { operation },
        cancelled => Cancelled { operation },
    }

    /// Transport-level failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                } else {
                    e.is_timeout() || e.is_connect() || e.is_request()
                }
            }
            Error::Network { .. } => true,
            Error::Timeout { .. } => true,
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Stable label attached to log records
    pub fn category(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::Protocol { .. } => "protocol",
            Error::MessageTooLarge { .. } => "message_too_large",
            Error::Mining { .. } => "mining",
            Error::Target { .. } => "target",
            Error::Mempool { .. } => "mempool",
            Error::Mint { .. } => "mint",
            Error::Crypto { .. } => "crypto",
            Error::Network { .. } => "network",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled { .. } => "cancelled",
            Error::AlreadyRunning => "already_running",
        }
    }
}
