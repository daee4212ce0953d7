//! Error types for the agent engine

use serde::Serialize;
use thiserror::Error;

use switchboard_ami_core::AmiError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Wire-level failure from the manager link
    #[error(transparent)]
    Ami(#[from] AmiError),

    /// The pause reason code is not in the catalog (or inactive)
    #[error("Unknown pause reason: {code}")]
    UnknownReason { code: String },

    /// The extension already has an open pause session
    #[error("Extension {extension} is already paused")]
    AlreadyPaused { extension: String },

    /// Unpause requested with no open session
    #[error("Extension {extension} is not paused")]
    NotPaused { extension: String },

    /// The supervisor already has an open spy session
    #[error("Extension {spyer} is already spying")]
    AlreadySpying { spyer: String },

    /// Spy stop requested with no open session
    #[error("Extension {spyer} is not spying")]
    NotSpying { spyer: String },

    /// No live channel could be resolved for the extension
    #[error("No active channel for extension {extension}")]
    NoActiveChannel { extension: String },

    /// A multi-queue pause failed partway; already-paused queues were
    /// rolled back.
    #[error("Pause of {extension} failed on queue {failed_queue}")]
    PartialPauseFailure {
        extension: String,
        failed_queue: String,
        rolled_back: Vec<String>,
    },

    /// A multi-step transfer failed partway
    #[error("Transfer failed at step {step}: {message}")]
    PartialTransferFailure {
        step: String,
        message: String,
        completed: Vec<String>,
    },

    /// Pause session store failure
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Structured failure report for external surfaces
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    pub recoverable: bool,
}

impl EngineError {
    pub fn unknown_reason(code: impl Into<String>) -> Self {
        Self::UnknownReason { code: code.into() }
    }

    pub fn no_active_channel(extension: impl Into<String>) -> Self {
        Self::NoActiveChannel {
            extension: extension.into(),
        }
    }

    /// Stable machine-readable discriminant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ami(AmiError::LinkLost { .. }) => "link_lost",
            Self::Ami(AmiError::ActionTimeout { .. }) => "action_timeout",
            Self::Ami(AmiError::ActionFailed { .. }) => "action_failed",
            Self::Ami(AmiError::AuthFailed) => "auth_failed",
            Self::Ami(AmiError::Protocol { .. }) => "protocol",
            Self::UnknownReason { .. } => "unknown_reason",
            Self::AlreadyPaused { .. } => "already_paused",
            Self::NotPaused { .. } => "not_paused",
            Self::AlreadySpying { .. } => "already_spying",
            Self::NotSpying { .. } => "not_spying",
            Self::NoActiveChannel { .. } => "no_active_channel",
            Self::PartialPauseFailure { .. } => "partial_pause_failure",
            Self::PartialTransferFailure { .. } => "partial_transfer_failure",
            Self::Storage(_) => "storage",
        }
    }

    /// Whether retrying the same call unchanged can succeed
    ///
    /// Only transient wire failures qualify; state guards and partial
    /// failures need the caller to change something first.
    pub fn recoverable(&self) -> bool {
        match self {
            Self::Ami(error) => error.recoverable(),
            Self::UnknownReason { .. }
            | Self::AlreadyPaused { .. }
            | Self::NotPaused { .. }
            | Self::AlreadySpying { .. }
            | Self::NotSpying { .. }
            | Self::NoActiveChannel { .. }
            | Self::PartialPauseFailure { .. }
            | Self::PartialTransferFailure { .. }
            | Self::Storage(_) => false,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            recoverable: self.recoverable(),
        }
    }
}
