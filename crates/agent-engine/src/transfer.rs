//! Call transfers
//!
//! Blind transfers are a single Redirect of the agent's live channel into
//! the dialplan. Attended transfers are a two-step sequence: park the
//! bridged peer, then originate a consultation call from the agent to the
//! transfer target. Each step retries once on timeout; a consultation
//! failure rolls the parked peer back to the agent so nobody is stranded
//! on hold.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;

use switchboard_ami_core::{AmiAction, AmiClient, AmiError};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{kinds, EventBroadcaster};
use crate::registry::ChannelRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Blind,
    Attended,
}

/// Audit record of one transfer attempt
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub transfer_type: TransferType,
    pub source: String,
    pub target: String,
    /// Steps that completed, in order
    pub steps: Vec<String>,
    pub ok: bool,
}

/// An attended transfer between park and completion
#[derive(Debug, Clone)]
struct PendingAttended {
    target: String,
    peer_channel: String,
    started_at: DateTime<Utc>,
}

pub struct TransferOrchestrator {
    client: Arc<dyn AmiClient>,
    registry: Arc<ChannelRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    config: Arc<EngineConfig>,
    pending: DashMap<String, PendingAttended>,
}

impl TransferOrchestrator {
    pub fn new(
        client: Arc<dyn AmiClient>,
        registry: Arc<ChannelRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            client,
            registry,
            broadcaster,
            config,
            pending: DashMap::new(),
        }
    }

    /// Send the agent's current call straight to `target`
    pub async fn blind_transfer(
        &self,
        source: &str,
        target: &str,
    ) -> EngineResult<TransferOutcome> {
        let info = self
            .registry
            .resolve(source)
            .ok_or_else(|| EngineError::no_active_channel(source))?;

        let action = AmiAction::new("Redirect")
            .field("Channel", info.name.clone())
            .field("Context", self.config.dial_context.clone())
            .field("Exten", target)
            .field("Priority", "1");
        if let Err(error) = self.client.send(action).await {
            self.publish_failed(TransferType::Blind, source, target, &error.to_string());
            return Err(error.into());
        }

        tracing::info!("Blind transfer: {} -> {}", source, target);
        let outcome = TransferOutcome {
            transfer_type: TransferType::Blind,
            source: source.to_string(),
            target: target.to_string(),
            steps: vec!["redirect".to_string()],
            ok: true,
        };
        self.publish_completed(&outcome);
        Ok(outcome)
    }

    /// Park the peer and call the target for consultation
    pub async fn attended_transfer(
        &self,
        source: &str,
        target: &str,
    ) -> EngineResult<TransferOutcome> {
        let info = self
            .registry
            .resolve(source)
            .ok_or_else(|| EngineError::no_active_channel(source))?;
        let bridge_id = info.bridge_id.clone();
        let peer_channel = bridge_id
            .as_deref()
            .and_then(|bridge| self.peer_in_bridge(bridge, &info.name))
            .ok_or_else(|| EngineError::no_active_channel(source))?;

        // Step 1: put the caller on hold in the parking lot. If parking
        // never completes the call is untouched, so this step needs no
        // rollback.
        let park = AmiAction::new("Park")
            .field("Channel", peer_channel.clone())
            .field("TimeoutChannel", info.name.clone())
            .field("Timeout", "45000");
        if let Err(error) = self.send_with_retry(park).await {
            self.publish_failed(TransferType::Attended, source, target, &error.to_string());
            return Err(EngineError::PartialTransferFailure {
                step: "park".to_string(),
                message: error.to_string(),
                completed: Vec::new(),
            });
        }

        // Step 2: consultation call from the agent to the target.
        let originate = AmiAction::new("Originate")
            .field("Channel", self.config.interface_for(source))
            .field("Exten", target)
            .field("Context", self.config.dial_context.clone())
            .field("Priority", "1")
            .field("CallerID", format!("Transfer <{}>", source))
            .field("Timeout", self.config.originate_timeout_ms.to_string())
            .field("Async", "true");
        if let Err(error) = self.send_with_retry(originate).await {
            // Give the parked caller back to the agent.
            self.redirect_home(&peer_channel, source).await;
            self.publish_failed(TransferType::Attended, source, target, &error.to_string());
            return Err(EngineError::PartialTransferFailure {
                step: "consultation".to_string(),
                message: error.to_string(),
                completed: vec!["park".to_string()],
            });
        }

        self.pending.insert(
            source.to_string(),
            PendingAttended {
                target: target.to_string(),
                peer_channel,
                started_at: Utc::now(),
            },
        );
        tracing::info!("Attended transfer started: {} -> {}", source, target);
        Ok(TransferOutcome {
            transfer_type: TransferType::Attended,
            source: source.to_string(),
            target: target.to_string(),
            steps: vec!["park".to_string(), "consultation".to_string()],
            ok: true,
        })
    }

    /// Join the parked peer to the consulted target and release the agent
    pub async fn complete_attended(&self, source: &str) -> EngineResult<TransferOutcome> {
        let Some((_, pending)) = self.pending.remove(source) else {
            return Err(EngineError::PartialTransferFailure {
                step: "complete".to_string(),
                message: format!("no attended transfer in progress for {}", source),
                completed: Vec::new(),
            });
        };

        let target_info = self.registry.resolve(&pending.target).ok_or_else(|| {
            EngineError::no_active_channel(&pending.target)
        })?;

        let bridge = AmiAction::new("Bridge")
            .field("Channel1", pending.peer_channel.clone())
            .field("Channel2", target_info.name.clone())
            .field("Tone", "no");
        if let Err(error) = self.send_with_retry(bridge).await {
            self.publish_failed(
                TransferType::Attended,
                source,
                &pending.target,
                &error.to_string(),
            );
            return Err(EngineError::PartialTransferFailure {
                step: "bridge".to_string(),
                message: error.to_string(),
                completed: vec!["park".to_string(), "consultation".to_string()],
            });
        }

        tracing::info!(
            "Attended transfer completed: {} -> {} ({}s consultation)",
            source,
            pending.target,
            (Utc::now() - pending.started_at).num_seconds()
        );
        let outcome = TransferOutcome {
            transfer_type: TransferType::Attended,
            source: source.to_string(),
            target: pending.target,
            steps: vec![
                "park".to_string(),
                "consultation".to_string(),
                "bridge".to_string(),
            ],
            ok: true,
        };
        self.publish_completed(&outcome);
        Ok(outcome)
    }

    /// Abort a consultation and pull the parked peer back to the agent
    pub async fn cancel_attended(&self, source: &str) -> EngineResult<()> {
        let Some((_, pending)) = self.pending.remove(source) else {
            return Err(EngineError::PartialTransferFailure {
                step: "cancel".to_string(),
                message: format!("no attended transfer in progress for {}", source),
                completed: Vec::new(),
            });
        };
        self.redirect_home(&pending.peer_channel, source).await;
        tracing::info!("Attended transfer cancelled: {} -> {}", source, pending.target);
        self.broadcaster.publish(
            kinds::TRANSFER_FAILED,
            source,
            json!({
                "type": TransferType::Attended,
                "target": pending.target,
                "cause": "cancelled",
            }),
        );
        Ok(())
    }

    /// Whether an attended transfer is awaiting completion
    pub fn has_pending(&self, source: &str) -> bool {
        self.pending.contains_key(source)
    }

    /// The other channel sharing a bridge with `channel`
    fn peer_in_bridge(&self, bridge_id: &str, channel: &str) -> Option<String> {
        self.registry
            .bridged_channels()
            .into_iter()
            .find(|c| c.bridge_id == bridge_id && c.channel != channel)
            .map(|c| c.channel)
    }

    /// Retry once on timeout; anything else fails immediately
    async fn send_with_retry(&self, action: AmiAction) -> Result<(), AmiError> {
        match self.client.send(action.clone()).await {
            Ok(_) => Ok(()),
            Err(AmiError::ActionTimeout { .. }) => {
                tracing::warn!("{} timed out; retrying once", action.name());
                self.client.send(action).await.map(|_| ())
            }
            Err(error) => Err(error),
        }
    }

    /// Best-effort return of a parked channel to the agent's extension
    async fn redirect_home(&self, channel: &str, extension: &str) {
        let action = AmiAction::new("Redirect")
            .field("Channel", channel.to_string())
            .field("Context", self.config.dial_context.clone())
            .field("Exten", extension)
            .field("Priority", "1");
        if let Err(error) = self.client.send(action).await {
            tracing::error!(
                "Failed to return parked channel {} to {}: {}",
                channel,
                extension,
                error
            );
        }
    }

    fn publish_completed(&self, outcome: &TransferOutcome) {
        self.broadcaster.publish(
            kinds::TRANSFER_COMPLETED,
            &outcome.source,
            json!({
                "type": outcome.transfer_type,
                "target": outcome.target,
                "steps": outcome.steps,
            }),
        );
    }

    fn publish_failed(&self, transfer_type: TransferType, source: &str, target: &str, message: &str) {
        self.broadcaster.publish(
            kinds::TRANSFER_FAILED,
            source,
            json!({
                "type": transfer_type,
                "target": target,
                "error": message,
            }),
        );
    }
}
