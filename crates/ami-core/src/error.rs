//! Error types for the AMI client library

use thiserror::Error;

/// Result type for AMI operations
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors that can occur on the AMI link
#[derive(Debug, Error, Clone)]
pub enum AmiError {
    /// The TCP connection to the manager interface dropped
    #[error("AMI link lost: {reason}")]
    LinkLost { reason: String },

    /// An action got no response within the configured window
    #[error("Action {action} timed out after {seconds} seconds")]
    ActionTimeout { action: String, seconds: u64 },

    /// The PBX answered with Response: Error
    #[error("Action {action} failed: {message}")]
    ActionFailed { action: String, message: String },

    /// Login was rejected
    #[error("AMI authentication failed")]
    AuthFailed,

    /// The peer sent something we could not parse
    #[error("AMI protocol error: {message}")]
    Protocol { message: String },
}

impl AmiError {
    /// Create a link-lost error
    pub fn link_lost(reason: impl Into<String>) -> Self {
        Self::LinkLost {
            reason: reason.into(),
        }
    }

    /// Create an action-failed error
    pub fn action_failed(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ActionFailed {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation after reconnection can succeed
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            Self::LinkLost { .. } | Self::ActionTimeout { .. }
        )
    }
}
