use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    #[error("Random source unavailable: {0}")]
    Entropy(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol conflict: {0}")]
    Conflict(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Session expired, login required")]
    SessionExpired,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid DID: {0}")]
    InvalidDid(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Agent {agent} lacks capability {capability}")]
    MissingCapability { agent: String, capability: String },

    #[error("Unsupported message type: {0}")]
    UnsupportedMessage(String),
}

impl BridgeError {
    /// Transport-level failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Delivery(_) | BridgeError::Timeout { .. })
    }

    /// Session failures that are only resolved by logging in again.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            BridgeError::Auth(_) | BridgeError::SessionExpired | BridgeError::NotAuthenticated
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::Delivery(err.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<p256::pkcs8::Error> for BridgeError {
    fn from(err: p256::pkcs8::Error) -> Self {
        BridgeError::InvalidKey(err.to_string())
    }
}

impl From<p256::elliptic_curve::Error> for BridgeError {
    fn from(err: p256::elliptic_curve::Error) -> Self {
        BridgeError::InvalidKey(err.to_string())
    }
}
