//! Real-time call-center agent control plane
//!
//! Sits between an external API surface and an Asterisk PBX's manager
//! interface, owning the stateful, failure-prone middle: agent pause
//! sessions with auto-unpause timers, supervisor spy sessions, and call
//! transfers, all kept consistent with a live channel registry built from
//! the manager event stream.
//!
//! The wire layer lives in `switchboard-ami-core`; this crate consumes it
//! through the [`AmiClient`](switchboard_ami_core::AmiClient) trait.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod pause;
pub mod registry;
pub mod scheduler;
pub mod spy;
pub mod transfer;

pub use config::EngineConfig;
pub use engine::AgentEngine;
pub use error::{EngineError, EngineResult, ErrorReport};
pub use events::{AgentEvent, EventBroadcaster};
pub use pause::{
    PauseCoordinator, PauseReason, PauseSession, PauseSessionStore, PauseStatus, ReasonCatalog,
    UnpauseOutcome,
};
pub use registry::{ChannelRegistry, ChannelInfo, SpyableChannel};
pub use scheduler::{CancelOutcome, UnpauseScheduler};
pub use spy::{SpyManager, SpyMode, SpySession, SpyTarget};
pub use transfer::{TransferOrchestrator, TransferOutcome, TransferType};
