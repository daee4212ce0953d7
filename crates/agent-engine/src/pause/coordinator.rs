//! Pause coordination
//!
//! Owns the agent pause state machine: validate the reason, pause every
//! target queue all-or-nothing, persist the session, arm the auto-unpause
//! timer for bounded reasons, and publish the outcome. All transitions for
//! one extension run under that extension's async mutex, which is what
//! keeps the single-open-session invariant and makes pause/unpause/auto-fire
//! serialize instead of interleave.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use switchboard_ami_core::{AmiAction, AmiClient};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{kinds, EventBroadcaster};
use crate::pause::reasons::ReasonCatalog;
use crate::pause::store::{PauseSession, PauseSessionStore};
use crate::registry::ChannelRegistry;
use crate::scheduler::UnpauseScheduler;

/// Result of an unpause
#[derive(Debug, Clone, Serialize)]
pub struct UnpauseOutcome {
    pub session_id: Uuid,
    pub extension: String,
    pub reason_code: String,
    pub duration_seconds: i64,
    pub auto_unpaused: bool,
    /// Set when the PBX rejected one or more queue unpauses; the session is
    /// closed locally regardless so the agent is not stuck paused.
    pub degraded: bool,
}

/// Current pause state for one extension
#[derive(Debug, Clone, Serialize)]
pub struct PauseStatus {
    pub paused: bool,
    pub session: Option<PauseSession>,
    pub elapsed_seconds: Option<i64>,
    pub remaining_seconds: Option<u64>,
}

#[derive(Clone)]
pub struct PauseCoordinator {
    client: Arc<dyn AmiClient>,
    registry: Arc<ChannelRegistry>,
    catalog: Arc<ReasonCatalog>,
    store: PauseSessionStore,
    scheduler: UnpauseScheduler,
    broadcaster: Arc<EventBroadcaster>,
    config: Arc<EngineConfig>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl PauseCoordinator {
    pub fn new(
        client: Arc<dyn AmiClient>,
        registry: Arc<ChannelRegistry>,
        catalog: Arc<ReasonCatalog>,
        store: PauseSessionStore,
        scheduler: UnpauseScheduler,
        broadcaster: Arc<EventBroadcaster>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            client,
            registry,
            catalog,
            store,
            scheduler,
            broadcaster,
            config,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, extension: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(extension.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Pause an agent in every target queue
    ///
    /// Queue selection order: explicit list, then the registry's known
    /// memberships, then the configured defaults.
    pub async fn pause(
        &self,
        extension: &str,
        reason_code: &str,
        queues: Option<Vec<String>>,
    ) -> EngineResult<PauseSession> {
        let lock = self.lock_for(extension);
        let _guard = lock.lock().await;

        let reason = self
            .catalog
            .get(reason_code)
            .ok_or_else(|| EngineError::unknown_reason(reason_code))?;

        if self.store.active_session(extension).await?.is_some() {
            return Err(EngineError::AlreadyPaused {
                extension: extension.to_string(),
            });
        }

        let queues = match queues {
            Some(queues) if !queues.is_empty() => queues,
            _ => {
                let known = self.registry.queues_for(extension);
                if known.is_empty() {
                    self.config.default_queues.clone()
                } else {
                    known
                }
            }
        };

        let interface = self.config.interface_for(extension);
        let mut paused_so_far: Vec<String> = Vec::new();
        for queue in &queues {
            let action = AmiAction::new("QueuePause")
                .field("Queue", queue.clone())
                .field("Interface", interface.clone())
                .field("Paused", "1")
                .field("Reason", reason.label.clone());
            if let Err(error) = self.client.send(action).await {
                tracing::warn!(
                    "Pause of {} failed on queue {}: {}; rolling back {:?}",
                    extension,
                    queue,
                    error,
                    paused_so_far
                );
                self.rollback_pause(&interface, &paused_so_far).await;
                return Err(EngineError::PartialPauseFailure {
                    extension: extension.to_string(),
                    failed_queue: queue.clone(),
                    rolled_back: paused_so_far,
                });
            }
            paused_so_far.push(queue.clone());
        }

        let session = PauseSession::open_now(extension, &reason.code, &reason.label, queues);
        self.store.open(&session).await?;

        if let Some(minutes) = reason.max_duration_minutes {
            self.arm_timer(extension, session.id, Duration::from_secs(u64::from(minutes) * 60));
        }

        tracing::info!(
            "Paused {} for {} in {} queue(s)",
            extension,
            reason.code,
            session.queues.len()
        );
        self.broadcaster.publish(
            kinds::AGENT_PAUSED,
            extension,
            json!({
                "sessionId": session.id,
                "reason": reason.code,
                "reasonLabel": reason.label,
                "queues": session.queues,
                "maxDurationMinutes": reason.max_duration_minutes,
            }),
        );
        Ok(session)
    }

    /// Undo already-paused queues after a mid-pause failure; best effort
    async fn rollback_pause(&self, interface: &str, queues: &[String]) {
        for queue in queues {
            let action = AmiAction::new("QueuePause")
                .field("Queue", queue.clone())
                .field("Interface", interface.to_string())
                .field("Paused", "0");
            if let Err(error) = self.client.send(action).await {
                tracing::error!("Rollback unpause failed for queue {}: {}", queue, error);
            }
        }
    }

    /// Manually unpause an agent
    pub async fn unpause(&self, extension: &str) -> EngineResult<UnpauseOutcome> {
        let lock = self.lock_for(extension);
        let _guard = lock.lock().await;

        let Some(session) = self.store.active_session(extension).await? else {
            return Err(EngineError::NotPaused {
                extension: extension.to_string(),
            });
        };
        // Disarm the timer so the auto path cannot fire afterwards.
        self.scheduler.cancel_for_session(extension, session.id);
        self.close_session(extension, session, false).await
    }

    /// Timer-driven unpause; a no-op when the armed session is gone
    async fn auto_fire(&self, extension: &str, session_id: Uuid) {
        let lock = self.lock_for(extension);
        let _guard = lock.lock().await;

        let session = match self.store.active_session(extension).await {
            Ok(Some(session)) if session.id == session_id => session,
            Ok(_) => {
                tracing::debug!(
                    "Auto-unpause for {} skipped; session {} no longer open",
                    extension,
                    session_id
                );
                return;
            }
            Err(error) => {
                tracing::error!("Auto-unpause lookup failed for {}: {}", extension, error);
                return;
            }
        };
        match self.close_session(extension, session, true).await {
            Ok(outcome) => tracing::info!(
                "Auto-unpaused {} after {}s",
                extension,
                outcome.duration_seconds
            ),
            Err(error) => tracing::error!("Auto-unpause of {} failed: {}", extension, error),
        }
    }

    /// Unpause every queue and close the session; caller holds the lock
    async fn close_session(
        &self,
        extension: &str,
        session: PauseSession,
        auto: bool,
    ) -> EngineResult<UnpauseOutcome> {
        let interface = self.config.interface_for(extension);
        let mut degraded = false;
        for queue in &session.queues {
            let action = AmiAction::new("QueuePause")
                .field("Queue", queue.clone())
                .field("Interface", interface.clone())
                .field("Paused", "0");
            if let Err(error) = self.client.send(action).await {
                // Close locally anyway; leaving the session open would wedge
                // the agent in paused state forever.
                tracing::warn!(
                    "Unpause of {} failed on queue {}: {}; continuing",
                    extension,
                    queue,
                    error
                );
                degraded = true;
            }
        }

        let now = Utc::now();
        let duration = (now - session.start_time).num_seconds().max(0);
        self.store.close(session.id, now, duration, auto).await?;

        self.broadcaster.publish(
            kinds::AGENT_UNPAUSED,
            extension,
            json!({
                "sessionId": session.id,
                "reason": session.reason_code,
                "autoUnpaused": auto,
                "pauseDuration": duration,
                "degraded": degraded,
            }),
        );
        Ok(UnpauseOutcome {
            session_id: session.id,
            extension: extension.to_string(),
            reason_code: session.reason_code,
            duration_seconds: duration,
            auto_unpaused: auto,
            degraded,
        })
    }

    fn arm_timer(&self, extension: &str, session_id: Uuid, delay: Duration) {
        let this = self.clone();
        let extension_owned = extension.to_string();
        self.scheduler.schedule(extension, session_id, delay, move || async move {
            this.auto_fire(&extension_owned, session_id).await;
        });
    }

    /// Open session plus elapsed/remaining time for one extension
    pub async fn get_pause_status(&self, extension: &str) -> EngineResult<PauseStatus> {
        let session = self.store.active_session(extension).await?;
        let elapsed = session
            .as_ref()
            .map(|s| (Utc::now() - s.start_time).num_seconds().max(0));
        let remaining = self
            .scheduler
            .remaining(extension)
            .map(|d| d.as_secs());
        Ok(PauseStatus {
            paused: session.is_some(),
            session,
            elapsed_seconds: elapsed,
            remaining_seconds: remaining,
        })
    }

    /// Every agent with an open pause session
    pub async fn paused_agents(&self) -> EngineResult<Vec<PauseSession>> {
        self.store.open_sessions().await
    }

    /// Session history for one extension, newest first
    pub async fn history(&self, extension: &str, limit: u32) -> EngineResult<Vec<PauseSession>> {
        self.store.history(extension, limit).await
    }

    /// Re-arm timers for open sessions after a restart or reconnect
    ///
    /// Bounded sessions already past their limit are closed immediately;
    /// the rest get the remaining time. Open-ended sessions are left alone.
    pub async fn restore(&self) -> EngineResult<usize> {
        let sessions = self.store.open_sessions().await?;
        let mut restored = 0;
        for session in sessions {
            let Some(reason) = self.catalog.get(&session.reason_code) else {
                tracing::warn!(
                    "Open session {} has unknown reason {}; leaving unbounded",
                    session.id,
                    session.reason_code
                );
                continue;
            };
            let Some(minutes) = reason.max_duration_minutes else {
                continue;
            };
            let deadline = session.start_time + chrono::Duration::minutes(i64::from(minutes));
            let remaining = deadline - Utc::now();
            if remaining <= chrono::Duration::zero() {
                self.auto_fire(&session.extension, session.id).await;
            } else {
                let delay = remaining
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                self.arm_timer(&session.extension, session.id, delay);
            }
            restored += 1;
        }
        if restored > 0 {
            tracing::info!("Restored {} pause timer(s)", restored);
        }
        Ok(restored)
    }
}
