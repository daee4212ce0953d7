//! Client trait seam
//!
//! The engine talks to the PBX through this trait so tests can substitute a
//! scripted fake for a live manager connection.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::AmiResult;
use crate::frame::{AmiAction, AmiEvent, AmiResponse};

/// Connection state notifications
///
/// `Lost` means pending actions have been failed and in-memory state derived
/// from the event stream is stale; consumers rebuild on the next `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Lost,
}

/// Handle to a manager connection
#[async_trait]
pub trait AmiClient: Send + Sync {
    /// Send an action and await its single response
    async fn send(&self, action: AmiAction) -> AmiResult<AmiResponse>;

    /// Send a list-style action and await the named terminating event,
    /// collecting the list-member events into the response.
    async fn send_expecting(&self, action: AmiAction, terminator: &str)
        -> AmiResult<AmiResponse>;

    /// Subscribe to uncorrelated events in wire order
    fn events(&self) -> broadcast::Receiver<AmiEvent>;

    /// Subscribe to connection state changes
    fn status(&self) -> broadcast::Receiver<LinkStatus>;

    fn is_connected(&self) -> bool;
}
