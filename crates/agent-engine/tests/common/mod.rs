//! Scripted fake manager client for engine tests
//!
//! Records every action the engine sends and answers from a per-action
//! script: queued replies are consumed in order, and an exhausted (or
//! absent) script yields a plain success. List-style sends drain queued
//! member events the same way.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use switchboard_ami_core::{
    AmiAction, AmiClient, AmiError, AmiEvent, AmiResponse, AmiResult, Fields, LinkStatus,
};

/// Route engine logs through the test harness; filter with `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct FakeAmi {
    sent: Mutex<Vec<AmiAction>>,
    replies: Mutex<HashMap<String, VecDeque<AmiResult<AmiResponse>>>>,
    list_events: Mutex<HashMap<String, VecDeque<Vec<AmiEvent>>>>,
    events_tx: broadcast::Sender<AmiEvent>,
    status_tx: broadcast::Sender<LinkStatus>,
    connected: AtomicBool,
}

impl FakeAmi {
    pub fn new() -> Self {
        init_tracing();
        let (events_tx, _) = broadcast::channel(256);
        let (status_tx, _) = broadcast::channel(16);
        Self {
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            list_events: Mutex::new(HashMap::new()),
            events_tx,
            status_tx,
            connected: AtomicBool::new(true),
        }
    }

    /// Queue a reply for the next send of the named action
    pub fn script_reply(&self, action: &str, reply: AmiResult<AmiResponse>) {
        self.replies
            .lock()
            .entry(action.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn script_success(&self, action: &str) {
        self.script_reply(action, Ok(success_response()));
    }

    pub fn script_failure(&self, action: &str, message: &str) {
        self.script_reply(
            action,
            Err(AmiError::action_failed(action, message)),
        );
    }

    pub fn script_timeout(&self, action: &str) {
        self.script_reply(
            action,
            Err(AmiError::ActionTimeout {
                action: action.to_string(),
                seconds: 10,
            }),
        );
    }

    /// Queue member events for the next `send_expecting` of the action
    pub fn script_list(&self, action: &str, events: Vec<AmiEvent>) {
        self.list_events
            .lock()
            .entry(action.to_string())
            .or_default()
            .push_back(events);
    }

    /// Everything the engine has sent, in order
    pub fn sent(&self) -> Vec<AmiAction> {
        self.sent.lock().clone()
    }

    pub fn sent_named(&self, name: &str) -> Vec<AmiAction> {
        self.sent
            .lock()
            .iter()
            .filter(|a| a.name() == name)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Push an unsolicited event to subscribers
    pub fn emit(&self, event: AmiEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        let status = if connected {
            LinkStatus::Connected
        } else {
            LinkStatus::Lost
        };
        let _ = self.status_tx.send(status);
    }

    fn next_reply(&self, action: &str) -> AmiResult<AmiResponse> {
        self.replies
            .lock()
            .get_mut(action)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(success_response()))
    }
}

#[async_trait]
impl AmiClient for FakeAmi {
    async fn send(&self, action: AmiAction) -> AmiResult<AmiResponse> {
        let name = action.name().to_string();
        self.sent.lock().push(action);
        self.next_reply(&name)
    }

    async fn send_expecting(
        &self,
        action: AmiAction,
        _terminator: &str,
    ) -> AmiResult<AmiResponse> {
        let name = action.name().to_string();
        self.sent.lock().push(action);
        let mut response = self.next_reply(&name)?;
        if let Some(events) = self
            .list_events
            .lock()
            .get_mut(&name)
            .and_then(VecDeque::pop_front)
        {
            response.events = events;
        }
        Ok(response)
    }

    fn events(&self) -> broadcast::Receiver<AmiEvent> {
        self.events_tx.subscribe()
    }

    fn status(&self) -> broadcast::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub fn success_response() -> AmiResponse {
    AmiResponse {
        fields: Fields::from_pairs(&[("Response", "Success")]),
        events: Vec::new(),
    }
}

pub fn event(name: &str, pairs: &[(&str, &str)]) -> AmiEvent {
    AmiEvent {
        name: name.to_string(),
        fields: Fields::from_pairs(pairs),
    }
}

/// Seed a registry-visible bridged call between an agent channel and a peer
pub fn bridged_call_events(
    agent_channel: &str,
    peer_channel: &str,
    bridge_id: &str,
) -> Vec<AmiEvent> {
    vec![
        event(
            "Newchannel",
            &[("Channel", agent_channel), ("ChannelStateDesc", "Up")],
        ),
        event(
            "Newchannel",
            &[("Channel", peer_channel), ("ChannelStateDesc", "Up")],
        ),
        event(
            "BridgeEnter",
            &[("Channel", agent_channel), ("BridgeUniqueid", bridge_id)],
        ),
        event(
            "BridgeEnter",
            &[("Channel", peer_channel), ("BridgeUniqueid", bridge_id)],
        ),
    ]
}
