//! Engine facade
//!
//! [`AgentEngine`] wires the manager client, channel registry, pause
//! coordination, spy sessions, transfers, and the event broadcaster into
//! one owned handle. A single consumer task drains the inbound event stream
//! in wire order, keeps the registry current, and runs the full resync
//! whenever the link reconnects.

use std::sync::Arc;

use tokio::task::JoinHandle;

use switchboard_ami_core::{AmiAction, AmiClient, AmiEvent, LinkStatus};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::{AgentEvent, EventBroadcaster};
use crate::pause::{
    PauseCoordinator, PauseReason, PauseSession, PauseSessionStore, PauseStatus, ReasonCatalog,
    UnpauseOutcome,
};
use crate::registry::{ChannelRegistry, SpyableChannel};
use crate::scheduler::UnpauseScheduler;
use crate::spy::{SpyManager, SpyMode, SpySession, SpyTarget};
use crate::transfer::{TransferOrchestrator, TransferOutcome};

pub struct AgentEngine {
    client: Arc<dyn AmiClient>,
    registry: Arc<ChannelRegistry>,
    catalog: Arc<ReasonCatalog>,
    broadcaster: Arc<EventBroadcaster>,
    pause: PauseCoordinator,
    spy: Arc<SpyManager>,
    transfer: Arc<TransferOrchestrator>,
}

impl AgentEngine {
    /// Build an engine over an existing client connection
    ///
    /// Opens the pause session store at the configured location and seeds
    /// the stock reason catalog; callers adjust it through [`catalog`].
    ///
    /// [`catalog`]: AgentEngine::catalog
    pub async fn new(client: Arc<dyn AmiClient>, config: EngineConfig) -> EngineResult<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(ChannelRegistry::new());
        let catalog = Arc::new(ReasonCatalog::with_defaults());
        let broadcaster = Arc::new(EventBroadcaster::default());
        let store = PauseSessionStore::connect(&config.database_url).await?;
        let scheduler = UnpauseScheduler::new();

        let pause = PauseCoordinator::new(
            client.clone(),
            registry.clone(),
            catalog.clone(),
            store,
            scheduler,
            broadcaster.clone(),
            config.clone(),
        );
        let spy = Arc::new(SpyManager::new(
            client.clone(),
            registry.clone(),
            broadcaster.clone(),
            config.clone(),
        ));
        let transfer = Arc::new(TransferOrchestrator::new(
            client.clone(),
            registry.clone(),
            broadcaster.clone(),
            config.clone(),
        ));

        Ok(Self {
            client,
            registry,
            catalog,
            broadcaster,
            pause,
            spy,
            transfer,
        })
    }

    /// Resync state and spawn the event consumer task
    pub async fn start(&self) -> EngineResult<JoinHandle<()>> {
        if self.client.is_connected() {
            if let Err(error) = self.resync().await {
                tracing::warn!("Initial channel resync failed: {}", error);
            }
        }
        self.pause.restore().await?;

        let client = self.client.clone();
        let registry = self.registry.clone();
        let spy = self.spy.clone();
        let pause = self.pause.clone();
        // Subscribe before spawning so no event published after this call
        // can slip past the consumer.
        let events = client.events();
        let status = client.status();
        let handle = tokio::spawn(async move {
            consume_events(client, registry, spy, pause, events, status).await;
        });
        Ok(handle)
    }

    /// Rebuild the registry from the PBX's view of the world
    async fn resync(&self) -> EngineResult<()> {
        resync_registry(self.client.as_ref(), &self.registry).await
    }

    // ---- pause surface ----

    pub async fn pause(
        &self,
        extension: &str,
        reason_code: &str,
        queues: Option<Vec<String>>,
    ) -> EngineResult<PauseSession> {
        self.pause.pause(extension, reason_code, queues).await
    }

    pub async fn unpause(&self, extension: &str) -> EngineResult<UnpauseOutcome> {
        self.pause.unpause(extension).await
    }

    pub async fn get_pause_status(&self, extension: &str) -> EngineResult<PauseStatus> {
        self.pause.get_pause_status(extension).await
    }

    pub async fn paused_agents(&self) -> EngineResult<Vec<PauseSession>> {
        self.pause.paused_agents().await
    }

    pub async fn pause_history(
        &self,
        extension: &str,
        limit: u32,
    ) -> EngineResult<Vec<PauseSession>> {
        self.pause.history(extension, limit).await
    }

    pub fn list_reasons(&self) -> Vec<PauseReason> {
        self.catalog.list()
    }

    // ---- spy surface ----

    pub async fn start_spy(
        &self,
        spyer: &str,
        target: SpyTarget,
        mode: SpyMode,
        volume: Option<i32>,
    ) -> EngineResult<SpySession> {
        self.spy.start(spyer, target, mode, volume).await
    }

    pub async fn stop_spy(&self, spyer: &str) -> EngineResult<SpySession> {
        self.spy.stop(spyer).await
    }

    pub fn list_spyable(&self) -> Vec<SpyableChannel> {
        self.spy.list_spyable()
    }

    pub fn active_spy_sessions(&self) -> Vec<SpySession> {
        self.spy.active_sessions()
    }

    // ---- transfer surface ----

    pub async fn blind_transfer(
        &self,
        source: &str,
        target: &str,
    ) -> EngineResult<TransferOutcome> {
        self.transfer.blind_transfer(source, target).await
    }

    pub async fn attended_transfer(
        &self,
        source: &str,
        target: &str,
    ) -> EngineResult<TransferOutcome> {
        self.transfer.attended_transfer(source, target).await
    }

    pub async fn complete_attended(&self, source: &str) -> EngineResult<TransferOutcome> {
        self.transfer.complete_attended(source).await
    }

    pub async fn cancel_attended(&self, source: &str) -> EngineResult<()> {
        self.transfer.cancel_attended(source).await
    }

    // ---- observation ----

    /// Subscribe to engine events (`agent:paused`, `spy:started`, ...)
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.broadcaster.subscribe()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<ReasonCatalog> {
        &self.catalog
    }
}

/// Apply one inbound manager event to engine state
fn apply_event(registry: &ChannelRegistry, spy: &SpyManager, event: &AmiEvent) {
    registry.apply(event);
    if event.name == "Hangup" {
        let channel = event.fields.get_or_empty("Channel");
        spy.handle_channel_down(channel);
    }
}

/// Drain events and link-status changes until the client goes away
///
/// Events are applied in wire order by this one task; nothing else writes
/// to the registry.
async fn consume_events(
    client: Arc<dyn AmiClient>,
    registry: Arc<ChannelRegistry>,
    spy: Arc<SpyManager>,
    pause: PauseCoordinator,
    mut events: tokio::sync::broadcast::Receiver<AmiEvent>,
    mut status: tokio::sync::broadcast::Receiver<LinkStatus>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => apply_event(&registry, &spy, &event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Event consumer lagged, {} event(s) lost; resyncing", missed);
                    if let Err(error) = resync_registry(client.as_ref(), &registry).await {
                        tracing::warn!("Registry resync after lag failed: {}", error);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            change = status.recv() => match change {
                Ok(LinkStatus::Connected) => {
                    tracing::info!("Link up; rebuilding engine state");
                    if let Err(error) = resync_registry(client.as_ref(), &registry).await {
                        tracing::warn!("Registry resync failed: {}", error);
                    }
                    spy.revalidate();
                    if let Err(error) = pause.restore().await {
                        tracing::warn!("Pause timer restore failed: {}", error);
                    }
                }
                Ok(LinkStatus::Lost) => {
                    // Stale registry reads are tolerated until the rebuild.
                    tracing::warn!("Link lost; state is stale until reconnect");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("Event consumer stopped");
}

/// Clear and rebuild the registry from CoreShowChannels + QueueStatus
async fn resync_registry(
    client: &dyn AmiClient,
    registry: &ChannelRegistry,
) -> EngineResult<()> {
    registry.clear();

    let channels = client
        .send_expecting(AmiAction::new("CoreShowChannels"), "CoreShowChannelsComplete")
        .await?;
    for event in &channels.events {
        registry.apply(event);
    }

    let queues = client
        .send_expecting(AmiAction::new("QueueStatus"), "QueueStatusComplete")
        .await?;
    for event in &queues.events {
        registry.apply(event);
    }

    tracing::info!(
        "Registry rebuilt: {} channel(s)",
        registry.channel_count()
    );
    Ok(())
}
