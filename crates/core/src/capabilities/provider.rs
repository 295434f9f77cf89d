//! CapabilityProvider trait definition

use async_trait::async_trait;
use thiserror::Error;

use super::CapabilityRole;

/// Errors raised by a capability backend
///
/// Any of these is fatal to a pipeline run; malformed-but-delivered output is
/// not an error at this layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no API key configured for {0}")]
    MissingCredentials(String),
}

impl CapabilityError {
    /// Whether the adapter may transparently retry the call
    pub fn is_retryable(&self) -> bool {
        match self {
            CapabilityError::Network(_) => true,
            CapabilityError::Api { status, .. } => matches!(status, 408 | 429 | 500..=599),
            CapabilityError::InvalidResponse(_) | CapabilityError::MissingCredentials(_) => false,
        }
    }
}

/// Stateless text-generation backend addressed by role
///
/// Each invocation is independent. The provider never interprets the
/// response; decoding belongs to the structured output parser.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Turn a prompt into generated text for the given role
    async fn invoke(&self, role: CapabilityRole, prompt: &str) -> Result<String, CapabilityError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(CapabilityError::Network("reset".to_string()).is_retryable());
        assert!(CapabilityError::Api {
            status: 429,
            message: "slow down".to_string()
        }
        .is_retryable());
        assert!(CapabilityError::Api {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_retryable());
        assert!(!CapabilityError::Api {
            status: 401,
            message: "bad key".to_string()
        }
        .is_retryable());
        assert!(!CapabilityError::MissingCredentials("OpenAI".to_string()).is_retryable());
    }
}
