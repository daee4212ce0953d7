//! Channel registry
//!
//! Live view of which channels and queue memberships belong to each
//! extension, built purely from the manager event stream. The engine's
//! consumer task is the single writer and applies events in wire order;
//! reads are point-in-time snapshots. On reconnect the whole view is thrown
//! away and rebuilt from `CoreShowChannels` + `QueueStatus`, so every apply
//! is an idempotent upsert or delete.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

use switchboard_ami_core::AmiEvent;

/// One live channel owned by an extension
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub state: String,
    pub caller_id_num: String,
    pub caller_id_name: String,
    pub connected_line_num: String,
    pub unique_id: String,
    pub bridge_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChannelInfo {
    pub fn is_up(&self) -> bool {
        self.state.eq_ignore_ascii_case("Up")
    }
}

/// A bridged, answered channel a supervisor could spy on
#[derive(Debug, Clone, Serialize)]
pub struct SpyableChannel {
    pub extension: String,
    pub channel: String,
    pub caller_id: String,
    pub peer_number: String,
    pub duration_seconds: i64,
    pub bridge_id: String,
}

#[derive(Debug, Default)]
struct AgentEntry {
    channels: Vec<ChannelInfo>,
    queues: BTreeSet<String>,
    last_seen: Option<DateTime<Utc>>,
}

/// Extension-keyed index over the live channel population
#[derive(Default)]
pub struct ChannelRegistry {
    agents: DashMap<String, AgentEntry>,
    /// Reverse index: channel name -> owning extension
    by_channel: DashMap<String, String>,
}

/// `PJSIP/1016-0000002a` -> `1016`
///
/// Strip the technology prefix, then cut at the last `-` (the uniqueness
/// suffix Asterisk appends).
pub fn extension_from_channel(channel: &str) -> Option<String> {
    let rest = channel.split_once('/').map(|(_, r)| r)?;
    let base = rest.rsplit_once('-').map(|(b, _)| b).unwrap_or(rest);
    if base.is_empty() {
        None
    } else {
        Some(base.to_string())
    }
}

/// `PJSIP/1016` -> `1016` (queue member interface strings carry no suffix)
fn extension_from_interface(interface: &str) -> Option<String> {
    let rest = interface.split_once('/').map(|(_, r)| r)?;
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one inbound event; unknown event kinds are ignored
    pub fn apply(&self, event: &AmiEvent) {
        match event.name.as_str() {
            "Newchannel" | "CoreShowChannel" => self.upsert_channel(event),
            "Newstate" => self.update_state(event),
            "Hangup" => {
                let channel = event.fields.get_or_empty("Channel");
                self.invalidate(channel);
            }
            "BridgeEnter" => self.set_bridge(event, true),
            "BridgeLeave" => self.set_bridge(event, false),
            "Rename" => self.rename(event),
            "QueueMemberStatus" | "QueueMember" => self.record_membership(event),
            _ => {}
        }
    }

    fn upsert_channel(&self, event: &AmiEvent) {
        let channel = event.fields.get_or_empty("Channel");
        let Some(extension) = extension_from_channel(channel) else {
            return;
        };
        let now = Utc::now();

        // CoreShowChannel rows report elapsed time as HH:MM:SS; back-date
        // the creation timestamp so duration math stays consistent.
        let created_at = event
            .fields
            .get("Duration")
            .and_then(parse_hms)
            .map(|secs| now - Duration::seconds(secs))
            .unwrap_or(now);

        let info = ChannelInfo {
            name: channel.to_string(),
            state: event
                .fields
                .get("ChannelStateDesc")
                .unwrap_or("Unknown")
                .to_string(),
            caller_id_num: event.fields.get_or_empty("CallerIDNum").to_string(),
            caller_id_name: event.fields.get_or_empty("CallerIDName").to_string(),
            connected_line_num: event.fields.get_or_empty("ConnectedLineNum").to_string(),
            unique_id: event.fields.get_or_empty("Uniqueid").to_string(),
            bridge_id: event
                .fields
                .get("BridgeId")
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            created_at,
        };

        self.by_channel
            .insert(channel.to_string(), extension.clone());
        let mut entry = self.agents.entry(extension).or_default();
        entry.last_seen = Some(now);
        match entry.channels.iter_mut().find(|c| c.name == channel) {
            Some(existing) => *existing = info,
            None => entry.channels.push(info),
        }
    }

    fn update_state(&self, event: &AmiEvent) {
        let channel = event.fields.get_or_empty("Channel");
        let Some(extension) = self.by_channel.get(channel).map(|e| e.clone()) else {
            // State change for a channel we never saw born; learn it now.
            self.upsert_channel(event);
            return;
        };
        if let Some(mut entry) = self.agents.get_mut(&extension) {
            entry.last_seen = Some(Utc::now());
            if let Some(info) = entry.channels.iter_mut().find(|c| c.name == channel) {
                if let Some(state) = event.fields.get("ChannelStateDesc") {
                    info.state = state.to_string();
                }
                if let Some(connected) = event.fields.get("ConnectedLineNum") {
                    info.connected_line_num = connected.to_string();
                }
            }
        }
    }

    fn set_bridge(&self, event: &AmiEvent, entering: bool) {
        let channel = event.fields.get_or_empty("Channel");
        let Some(extension) = self.by_channel.get(channel).map(|e| e.clone()) else {
            return;
        };
        if let Some(mut entry) = self.agents.get_mut(&extension) {
            if let Some(info) = entry.channels.iter_mut().find(|c| c.name == channel) {
                info.bridge_id = if entering {
                    event
                        .fields
                        .get("BridgeUniqueid")
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                } else {
                    None
                };
            }
        }
    }

    fn rename(&self, event: &AmiEvent) {
        let old_name = event.fields.get_or_empty("Channel");
        let new_name = event.fields.get_or_empty("Newname");
        if old_name.is_empty() || new_name.is_empty() {
            return;
        }
        let Some((_, extension)) = self.by_channel.remove(old_name) else {
            return;
        };
        self.by_channel
            .insert(new_name.to_string(), extension.clone());
        if let Some(mut entry) = self.agents.get_mut(&extension) {
            if let Some(info) = entry.channels.iter_mut().find(|c| c.name == old_name) {
                info.name = new_name.to_string();
            }
        }
    }

    fn record_membership(&self, event: &AmiEvent) {
        let queue = event.fields.get_or_empty("Queue");
        let interface = event.fields.get_or_empty("Interface");
        let Some(extension) = extension_from_interface(interface) else {
            return;
        };
        if queue.is_empty() {
            return;
        }
        let mut entry = self.agents.entry(extension).or_default();
        entry.last_seen = Some(Utc::now());
        entry.queues.insert(queue.to_string());
    }

    /// Most recent live channel for the extension
    pub fn resolve(&self, extension: &str) -> Option<ChannelInfo> {
        self.agents.get(extension).and_then(|entry| {
            entry
                .channels
                .iter()
                .max_by_key(|c| c.created_at)
                .cloned()
        })
    }

    /// The extension that owns a channel, if known
    pub fn owner_of(&self, channel: &str) -> Option<String> {
        self.by_channel.get(channel).map(|e| e.clone())
    }

    /// Drop a channel from the view; returns the owning extension
    pub fn invalidate(&self, channel: &str) -> Option<String> {
        let (_, extension) = self.by_channel.remove(channel)?;
        if let Some(mut entry) = self.agents.get_mut(&extension) {
            entry.channels.retain(|c| c.name != channel);
        }
        Some(extension)
    }

    /// Queue memberships known for the extension
    pub fn queues_for(&self, extension: &str) -> Vec<String> {
        self.agents
            .get(extension)
            .map(|entry| entry.queues.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Bridged, answered channels summarized as spy targets
    pub fn bridged_channels(&self) -> Vec<SpyableChannel> {
        let now = Utc::now();
        let mut out = Vec::new();
        for entry in self.agents.iter() {
            for info in &entry.channels {
                let Some(bridge_id) = &info.bridge_id else {
                    continue;
                };
                if !info.is_up() {
                    continue;
                }
                out.push(SpyableChannel {
                    extension: entry.key().clone(),
                    channel: info.name.clone(),
                    caller_id: info.caller_id_name.clone(),
                    peer_number: info.connected_line_num.clone(),
                    duration_seconds: (now - info.created_at).num_seconds().max(0),
                    bridge_id: bridge_id.clone(),
                });
            }
        }
        out.sort_by(|a, b| a.extension.cmp(&b.extension));
        out
    }

    /// Throw the whole view away (reconnect resync)
    pub fn clear(&self) {
        self.agents.clear();
        self.by_channel.clear();
    }

    pub fn channel_count(&self) -> usize {
        self.by_channel.len()
    }
}

fn parse_hms(text: &str) -> Option<i64> {
    let mut parts = text.split(':');
    let h: i64 = parts.next()?.parse().ok()?;
    let m: i64 = parts.next()?.parse().ok()?;
    let s: i64 = parts.next()?.parse().ok()?;
    Some(h * 3600 + m * 60 + s)
}
