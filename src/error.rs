//! Error types for the Halberd scanning engine

use crate::browser::BrowserType;
use thiserror::Error;

/// Main error type for Halberd operations
#[derive(Debug, Error)]
pub enum HalberdError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Proxy transport error: {0}")]
    HyperError(#[from] hyper::Error),

    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid pattern: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No {browser_type} browser became available within {waited_ms} ms")]
    BrowserUnavailable {
        browser_type: BrowserType,
        waited_ms: u64,
    },

    #[error("Browser pool misuse: {0}")]
    PoolMisuse(String),

    #[error("No pool is provisioned for browser type {0}")]
    UnknownBrowserType(BrowserType),

    #[error("Payload set '{0}' not found")]
    PayloadNotFound(String),

    #[error("Browser error: {0}")]
    BrowserError(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Scan cancelled")]
    Cancelled,
}

/// Result type alias for Halberd operations
pub type Result<T> = std::result::Result<T, HalberdError>;
