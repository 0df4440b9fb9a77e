//! Error taxonomy for shared broker connections
//!
//! Every failure is recovered locally and surfaced through status and logs;
//! these types let callers inspect what went wrong without the bridge itself
//! ever aborting on a per-message failure.

use crate::auth::TokenError;
use crate::broker::PublishError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for node and connection operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid broker configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("Invalid topic: {topic}")]
    TopicInvalid { topic: String },

    #[error("Token fetch failed: {0}")]
    Token(#[from] TokenError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl BridgeError {
    /// Create invalid broker configuration error
    pub fn config_invalid<S: Into<String>>(message: S) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Create invalid topic error
    pub fn topic_invalid<S: Into<String>>(topic: S) -> Self {
        Self::TopicInvalid {
            topic: topic.into(),
        }
    }

    /// Error text safe to put in logs and status lines
    pub fn redacted(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|challenge|secret)[=:]\s*\S+").expect("valid secret pattern")
});

/// Redact credential-looking fragments and cap the length of an error message
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
