//! Channel spy sessions
//!
//! Supervisors listen in on agent calls through the dialplan's ChanSpy
//! application: starting a session originates a call to the supervisor's
//! own device with ChanSpy as the application, stopping one hangs that leg
//! up. A supervisor holds at most one session at a time, and the PBX offers
//! no way to change mode in place; callers stop and restart instead.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use switchboard_ami_core::{AmiAction, AmiClient};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{kinds, EventBroadcaster};
use crate::registry::{extension_from_channel, ChannelRegistry, SpyableChannel};

/// Audibility of the supervisor on the spied call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpyMode {
    /// Hear both parties, speak to neither
    Listen,
    /// Speak to the agent only
    Whisper,
    /// Speak to both parties
    Barge,
}

impl SpyMode {
    fn option_flag(self) -> &'static str {
        match self {
            Self::Listen => "",
            Self::Whisper => "w",
            Self::Barge => "B",
        }
    }
}

/// What to spy on
#[derive(Debug, Clone)]
pub enum SpyTarget {
    /// Resolve the extension's current channel through the registry
    Extension(String),
    /// Spy on an explicit channel name
    Channel(String),
}

/// One active spy session
#[derive(Debug, Clone, Serialize)]
pub struct SpySession {
    pub id: Uuid,
    pub spyer: String,
    pub target_extension: Option<String>,
    pub target_channel: String,
    pub mode: SpyMode,
    pub volume: Option<i32>,
    pub started_at: DateTime<Utc>,
}

/// ChanSpy dial-string options
///
/// Always quiet (`q`, no beep into the call) and self-terminating on target
/// hangup (`S`). Volume outside ChanSpy's -4..=4 range is dropped rather
/// than clamped; an out-of-range boost is a caller bug, not an intent.
pub fn chanspy_options(mode: SpyMode, volume: Option<i32>) -> String {
    let mut options = String::from("q");
    options.push_str(mode.option_flag());
    if let Some(v) = volume {
        if (-4..=4).contains(&v) {
            options.push_str(&format!("v({})", v));
        } else {
            tracing::warn!("Ignoring out-of-range spy volume {}", v);
        }
    }
    options.push('S');
    options
}

pub struct SpyManager {
    client: Arc<dyn AmiClient>,
    registry: Arc<ChannelRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    config: Arc<EngineConfig>,
    sessions: DashMap<String, SpySession>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SpyManager {
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
            sessions: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, spyer: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(spyer.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start spying; the supervisor's device rings and joins on answer
    pub async fn start(
        &self,
        spyer: &str,
        target: SpyTarget,
        mode: SpyMode,
        volume: Option<i32>,
    ) -> EngineResult<SpySession> {
        let lock = self.lock_for(spyer);
        let _guard = lock.lock().await;

        if self.sessions.contains_key(spyer) {
            return Err(EngineError::AlreadySpying {
                spyer: spyer.to_string(),
            });
        }

        let (target_channel, target_extension) = match target {
            SpyTarget::Extension(extension) => {
                let info = self
                    .registry
                    .resolve(&extension)
                    .ok_or_else(|| EngineError::no_active_channel(&extension))?;
                (info.name, Some(extension))
            }
            SpyTarget::Channel(channel) => {
                let extension = extension_from_channel(&channel);
                (channel, extension)
            }
        };

        // ChanSpy attaches by channel prefix, not the concrete leg name.
        let target_prefix = target_channel
            .split('-')
            .next()
            .unwrap_or(&target_channel);
        let options = chanspy_options(mode, volume);
        let action = AmiAction::new("Originate")
            .field("Channel", self.config.interface_for(spyer))
            .field("Application", "ChanSpy")
            .field("Data", format!("{},{}", target_prefix, options))
            .field("CallerID", format!("Supervisor <{}>", spyer))
            .field("Timeout", self.config.originate_timeout_ms.to_string())
            .field("Async", "true");
        self.client.send(action).await?;

        let session = SpySession {
            id: Uuid::new_v4(),
            spyer: spyer.to_string(),
            target_extension: target_extension.clone(),
            target_channel: target_channel.clone(),
            mode,
            volume,
            started_at: Utc::now(),
        };
        self.sessions.insert(spyer.to_string(), session.clone());

        tracing::info!("{} spying on {} ({:?})", spyer, target_channel, mode);
        self.broadcaster.publish(
            kinds::SPY_STARTED,
            spyer,
            json!({
                "sessionId": session.id,
                "target": target_channel,
                "targetExtension": target_extension,
                "mode": mode,
            }),
        );
        Ok(session)
    }

    /// Stop spying by hanging up the supervisor's spy leg
    ///
    /// The session is removed even when the hangup fails; the `S` option
    /// means a stale leg dies with the target call anyway.
    pub async fn stop(&self, spyer: &str) -> EngineResult<SpySession> {
        let lock = self.lock_for(spyer);
        let _guard = lock.lock().await;

        let Some((_, session)) = self.sessions.remove(spyer) else {
            return Err(EngineError::NotSpying {
                spyer: spyer.to_string(),
            });
        };

        match self.registry.resolve(spyer) {
            Some(info) => {
                let action = AmiAction::new("Hangup")
                    .field("Channel", info.name)
                    .field("Cause", "16");
                if let Err(error) = self.client.send(action).await {
                    tracing::warn!("Spy hangup for {} failed: {}", spyer, error);
                }
            }
            None => {
                tracing::debug!("No live spy leg found for {}; dropping session", spyer);
            }
        }

        self.publish_stopped(&session, "requested");
        Ok(session)
    }

    /// Tear down sessions touching a channel that just hung up
    ///
    /// Called from the engine's event loop for every `Hangup`. Covers both
    /// the supervisor's leg dying and the spied call ending.
    pub fn handle_channel_down(&self, channel: &str) {
        let hung_extension = extension_from_channel(channel);
        let affected: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.target_channel == channel
                    || hung_extension.as_deref() == Some(entry.spyer.as_str())
            })
            .map(|entry| entry.key().clone())
            .collect();
        for spyer in affected {
            if let Some((_, session)) = self.sessions.remove(&spyer) {
                tracing::info!("Spy session of {} ended by hangup of {}", spyer, channel);
                self.publish_stopped(&session, "hangup");
            }
        }
    }

    /// Drop sessions whose target vanished; used after a reconnect rebuild
    pub fn revalidate(&self) {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| self.registry.owner_of(&entry.target_channel).is_none())
            .map(|entry| entry.key().clone())
            .collect();
        for spyer in stale {
            if let Some((_, session)) = self.sessions.remove(&spyer) {
                tracing::info!(
                    "Dropping spy session of {}; target {} gone after resync",
                    spyer,
                    session.target_channel
                );
                self.publish_stopped(&session, "resync");
            }
        }
    }

    fn publish_stopped(&self, session: &SpySession, cause: &str) {
        self.broadcaster.publish(
            kinds::SPY_STOPPED,
            &session.spyer,
            json!({
                "sessionId": session.id,
                "target": session.target_channel,
                "cause": cause,
            }),
        );
    }

    /// Bridged, answered calls a supervisor could attach to
    pub fn list_spyable(&self) -> Vec<SpyableChannel> {
        self.registry.bridged_channels()
    }

    pub fn active_sessions(&self) -> Vec<SpySession> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn session_for(&self, spyer: &str) -> Option<SpySession> {
        self.sessions.get(spyer).map(|e| e.clone())
    }
}
