//! Agent pause handling: reason catalog, session log, coordination

pub mod coordinator;
pub mod reasons;
pub mod store;

pub use coordinator::{PauseCoordinator, PauseStatus, UnpauseOutcome};
pub use reasons::{PauseReason, ReasonCatalog};
pub use store::{PauseSession, PauseSessionStore};
