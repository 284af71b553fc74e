//! Error types for the user agent

use thiserror::Error;

/// Result type for user agent operations
pub type Result<T> = std::result::Result<T, UaError>;

/// Errors surfaced by the user agent and its collaborators
#[derive(Debug, Error)]
pub enum UaError {
    /// Transport send/receive failure or unresolvable destination
    #[error("Network error: {message}")]
    Network { message: String },

    /// A call is already in progress
    #[error("Busy: a call is already in progress")]
    Busy,

    /// Action invoked in a state that does not allow it
    #[error("Session error: {message}")]
    Session { message: String },

    /// Empty or malformed call target
    #[error("Invalid address: {address:?}")]
    InvalidAddress { address: String },

    /// Inbound text could not be decoded as a SIP message
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Digest challenge missing required parameters
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Call attempted without the configured authorization code
    #[error("Incorrect authorization code")]
    Unauthorized,

    /// Settings could not be loaded or saved
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UaError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for the `Busy` variant
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            UaError::network("unreachable").to_string(),
            "Network error: unreachable"
        );
        assert!(UaError::Busy.is_busy());
        assert!(!UaError::session("no call").is_busy());
    }
}
