//! Persistent AMI link
//!
//! One TCP connection to the manager port, owned by a supervisor task.
//! The reader task decodes frames in wire order and routes them: correlated
//! frames resolve pending actions, everything else fans out on a broadcast
//! channel. When the connection drops, all pending actions fail fast and the
//! supervisor reconnects with exponential backoff; no state is replayed, so
//! consumers resynchronize from scratch on `LinkStatus::Connected`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};

use crate::client::{AmiClient, LinkStatus};
use crate::correlator::ActionCorrelator;
use crate::error::{AmiError, AmiResult};
use crate::frame::{AmiAction, AmiEvent, AmiFrame, AmiResponse, FrameDecoder};

/// Connection parameters for [`AmiLink::connect`]
#[derive(Debug, Clone)]
pub struct AmiLinkConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    /// Per-action response window
    pub action_timeout: Duration,
    /// First reconnect delay; doubles per attempt
    pub reconnect_base: Duration,
    /// Backoff ceiling
    pub reconnect_cap: Duration,
}

impl Default for AmiLinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5038,
            username: String::new(),
            secret: String::new(),
            action_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
        }
    }
}

struct Inner {
    config: AmiLinkConfig,
    correlator: ActionCorrelator,
    writer: Mutex<Option<OwnedWriteHalf>>,
    events_tx: broadcast::Sender<AmiEvent>,
    status_tx: broadcast::Sender<LinkStatus>,
    connected: AtomicBool,
    shutdown: AtomicBool,
}

/// A live manager connection
///
/// Cheap to clone; all clones share one TCP session.
#[derive(Clone)]
pub struct AmiLink {
    inner: Arc<Inner>,
}

impl AmiLink {
    /// Connect, consume the banner, and log in
    ///
    /// Fails fast on an unreachable host or rejected credentials. After a
    /// successful login, later drops are handled by the internal reconnect
    /// loop and never surface here.
    pub async fn connect(config: AmiLinkConfig) -> AmiResult<Self> {
        let (events_tx, _) = broadcast::channel(1024);
        let (status_tx, _) = broadcast::channel(16);
        let inner = Arc::new(Inner {
            config,
            correlator: ActionCorrelator::new(),
            writer: Mutex::new(None),
            events_tx,
            status_tx,
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let read_half = inner.establish().await?;
        let reader = tokio::spawn(Inner::read_loop(inner.clone(), read_half));
        if let Err(error) = inner.login().await {
            reader.abort();
            return Err(error);
        }
        inner.mark_connected();

        tokio::spawn(Inner::supervise(inner.clone(), reader));
        Ok(Self { inner })
    }

    /// Stop reconnecting and drop the connection
    pub async fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.writer.lock().await.take();
    }
}

#[async_trait]
impl AmiClient for AmiLink {
    async fn send(&self, action: AmiAction) -> AmiResult<AmiResponse> {
        if !self.is_connected() {
            return Err(AmiError::link_lost("not connected"));
        }
        self.inner.dispatch(action, None).await
    }

    async fn send_expecting(
        &self,
        action: AmiAction,
        terminator: &str,
    ) -> AmiResult<AmiResponse> {
        if !self.is_connected() {
            return Err(AmiError::link_lost("not connected"));
        }
        self.inner.dispatch(action, Some(terminator)).await
    }

    fn events(&self) -> broadcast::Receiver<AmiEvent> {
        self.inner.events_tx.subscribe()
    }

    fn status(&self) -> broadcast::Receiver<LinkStatus> {
        self.inner.status_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl Inner {
    /// Open the socket and park the write half; the caller owns the reader
    async fn establish(&self) -> AmiResult<OwnedReadHalf> {
        let address = (self.config.host.as_str(), self.config.port);
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| AmiError::link_lost(format!("connect failed: {}", e)))?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        tracing::info!(
            "AMI connected to {}:{}",
            self.config.host,
            self.config.port
        );
        Ok(read_half)
    }

    async fn login(&self) -> AmiResult<()> {
        let action = AmiAction::new("Login")
            .field("Username", self.config.username.clone())
            .field("Secret", self.config.secret.clone());
        match self.dispatch(action, None).await {
            Ok(_) => {
                tracing::info!("AMI login accepted for {}", self.config.username);
                Ok(())
            }
            Err(AmiError::ActionFailed { .. }) => Err(AmiError::AuthFailed),
            Err(error) => Err(error),
        }
    }

    fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.status_tx.send(LinkStatus::Connected);
    }

    fn mark_lost(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.correlator.fail_all(AmiError::link_lost(reason));
        let _ = self.status_tx.send(LinkStatus::Lost);
        tracing::warn!("AMI link lost: {}", reason);
    }

    /// Stamp, write, and await one action
    async fn dispatch(
        &self,
        action: AmiAction,
        terminator: Option<&str>,
    ) -> AmiResult<AmiResponse> {
        let name = action.name().to_string();
        let (action_id, rx) = match terminator {
            Some(term) => self.correlator.register_list(&name, term),
            None => self.correlator.register(&name),
        };
        let wire = action.to_wire(&action_id);

        {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                self.correlator.forget(&action_id);
                return Err(AmiError::link_lost("no writer"));
            };
            if let Err(error) = writer.write_all(&wire).await {
                self.correlator.forget(&action_id);
                return Err(AmiError::link_lost(format!("write failed: {}", error)));
            }
        }

        let timeout = self.config.action_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a value; only fail_all does that with a
            // value, so this is a teardown race.
            Ok(Err(_)) => Err(AmiError::link_lost("link closed")),
            Err(_) => {
                self.correlator.forget(&action_id);
                Err(AmiError::ActionTimeout {
                    action: name,
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// Decode and route inbound frames until the socket drops
    async fn read_loop(inner: Arc<Inner>, mut read_half: OwnedReadHalf) -> String {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => return "connection closed by peer".to_string(),
                Ok(n) => n,
                Err(error) => return format!("read failed: {}", error),
            };
            decoder.extend(&buf[..n]);
            loop {
                match decoder.next_frame() {
                    Ok(Some(AmiFrame::Response(response))) => {
                        if let Some(orphan) = inner.correlator.accept_response(response) {
                            tracing::debug!(
                                "Dropping uncorrelated response (ActionID {:?})",
                                orphan.action_id()
                            );
                        }
                    }
                    Ok(Some(AmiFrame::Event(event))) => {
                        if let Some(event) = inner.correlator.accept_event(event) {
                            // No receivers is fine; fan-out is best effort.
                            let _ = inner.events_tx.send(event);
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!("Skipping malformed AMI frame: {}", error);
                    }
                }
            }
        }
    }

    /// Own the connection lifecycle after the first successful login
    async fn supervise(inner: Arc<Inner>, mut reader: tokio::task::JoinHandle<String>) {
        let mut backoff = inner.config.reconnect_base;
        loop {
            let reason = match (&mut reader).await {
                Ok(reason) => reason,
                Err(_) => "reader task aborted".to_string(),
            };
            inner.writer.lock().await.take();
            if inner.shutdown.load(Ordering::SeqCst) {
                inner.connected.store(false, Ordering::SeqCst);
                return;
            }
            inner.mark_lost(&reason);

            // Reconnect with exponential backoff, forever.
            loop {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(inner.config.reconnect_cap);
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let read_half = match inner.establish().await {
                    Ok(half) => half,
                    Err(error) => {
                        tracing::warn!("AMI reconnect failed: {}", error);
                        continue;
                    }
                };
                let handle = tokio::spawn(Inner::read_loop(inner.clone(), read_half));
                match inner.login().await {
                    Ok(()) => {
                        inner.mark_connected();
                        backoff = inner.config.reconnect_base;
                        reader = handle;
                        break;
                    }
                    Err(error) => {
                        tracing::warn!("AMI re-login failed: {}", error);
                        handle.abort();
                        inner.writer.lock().await.take();
                    }
                }
            }
        }
    }
}
