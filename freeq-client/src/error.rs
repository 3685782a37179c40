//! Error types for the registration handshake.

use crate::sasl::SaslError;

/// Why capability negotiation did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("SASL authentication failed: {0}")]
    AuthFailed(#[from] SaslError),
    #[error("SASL setup timed out")]
    AuthTimeout,
    #[error("connection closed during registration")]
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
