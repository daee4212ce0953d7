//! AMI wire framing
//!
//! The manager interface is line oriented: a frame is a sequence of
//! `Key: value\r\n` lines terminated by a blank line. The very first bytes
//! on a fresh connection are a banner line (`Asterisk Call Manager/x.y`)
//! that is not a frame and carries no trailing blank line of its own.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame delimiter on the wire
const FRAME_END: &[u8] = b"\r\n\r\n";

/// Banner prefix sent by Asterisk before the first frame
const BANNER_PREFIX: &str = "Asterisk Call Manager/";

/// An outbound manager action
///
/// Fields keep insertion order; Asterisk cares for `Action` coming first.
/// The link stamps `ActionID` just before writing, callers never set it.
#[derive(Debug, Clone)]
pub struct AmiAction {
    name: String,
    fields: Vec<(String, String)>,
}

impl AmiAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field (builder style)
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Append a field only when the value is present
    pub fn field_opt(self, key: impl Into<String>, value: Option<String>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    /// The action name, e.g. `QueuePause`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Case-insensitive field lookup
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize with the given ActionID stamped in
    pub fn to_wire(&self, action_id: &str) -> Vec<u8> {
        let mut out = String::with_capacity(64 + self.fields.len() * 24);
        out.push_str("Action: ");
        out.push_str(&self.name);
        out.push_str("\r\n");
        out.push_str("ActionID: ");
        out.push_str(action_id);
        out.push_str("\r\n");
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Key/value fields of a decoded frame with case-insensitive lookup
///
/// Asterisk is not consistent about header casing across versions
/// (`Uniqueid` vs `UniqueID`), so lookups fold case.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_or_empty(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Build a field set from literal pairs; handy for synthesized frames
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn push(&mut self, key: String, value: String) {
        self.0.push((key, value));
    }
}

/// An unsolicited (or list-member) event frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AmiEvent {
    /// The `Event` header value, e.g. `Hangup`
    pub name: String,
    pub fields: Fields,
}

impl AmiEvent {
    /// The ActionID carried by list-member events, if any
    pub fn action_id(&self) -> Option<&str> {
        self.fields.get("ActionID")
    }
}

/// A response frame, plus any list events collected for it
#[derive(Debug, Clone, Default)]
pub struct AmiResponse {
    pub fields: Fields,
    /// List-member events accumulated for `send_expecting` calls
    pub events: Vec<AmiEvent>,
}

impl AmiResponse {
    /// Whether the PBX reported success
    pub fn is_success(&self) -> bool {
        self.fields
            .get("Response")
            .map(|v| v.eq_ignore_ascii_case("Success") || v.eq_ignore_ascii_case("Follows"))
            .unwrap_or(false)
    }

    /// The `Message` header, commonly set on errors
    pub fn message(&self) -> &str {
        self.fields.get_or_empty("Message")
    }

    pub fn action_id(&self) -> Option<&str> {
        self.fields.get("ActionID")
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone)]
pub enum AmiFrame {
    Response(AmiResponse),
    Event(AmiEvent),
}

/// Incremental frame decoder over a byte buffer
///
/// Feed raw socket reads into `extend`, then drain frames with `next_frame`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    banner_seen: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The banner line, once observed
    pub fn banner_seen(&self) -> bool {
        self.banner_seen
    }

    /// Pop the next complete frame, or `None` if more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<AmiFrame>, crate::error::AmiError> {
        // The banner is a bare line before any frame; strip it once.
        if !self.banner_seen {
            if let Some(pos) = find(&self.buf, b"\r\n") {
                let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
                if line.starts_with(BANNER_PREFIX) {
                    self.buf.advance(pos + 2);
                    self.banner_seen = true;
                    tracing::debug!("AMI banner: {}", line);
                } else {
                    // Connected to something that is not Asterisk
                    self.banner_seen = true;
                }
            } else {
                return Ok(None);
            }
        }

        let Some(end) = find(&self.buf, FRAME_END) else {
            return Ok(None);
        };

        let raw = self.buf.split_to(end + FRAME_END.len());
        let text = String::from_utf8_lossy(&raw[..end]).into_owned();
        Ok(Some(parse_frame(&text)?))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_frame(text: &str) -> Result<AmiFrame, crate::error::AmiError> {
    let mut fields = Fields::default();
    let mut event_name: Option<String> = None;
    let mut is_response = false;

    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            // Follows-style output lines have no colon; keep them addressable.
            fields.push("Output".to_string(), line.to_string());
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("Event") {
            event_name = Some(value.to_string());
        }
        if key.eq_ignore_ascii_case("Response") {
            is_response = true;
        }
        fields.push(key.to_string(), value.to_string());
    }

    if is_response {
        Ok(AmiFrame::Response(AmiResponse {
            fields,
            events: Vec::new(),
        }))
    } else if let Some(name) = event_name {
        Ok(AmiFrame::Event(AmiEvent { name, fields }))
    } else {
        Err(crate::error::AmiError::protocol(format!(
            "frame with neither Response nor Event key: {:?}",
            text.lines().next().unwrap_or("")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serializes_in_order_with_action_id() {
        let action = AmiAction::new("QueuePause")
            .field("Queue", "support")
            .field("Interface", "PJSIP/1016")
            .field("Paused", "1")
            .field("Reason", "Lunch Break");
        let wire = String::from_utf8(action.to_wire("abc-123")).unwrap();
        assert_eq!(
            wire,
            "Action: QueuePause\r\nActionID: abc-123\r\nQueue: support\r\n\
             Interface: PJSIP/1016\r\nPaused: 1\r\nReason: Lunch Break\r\n\r\n"
        );
    }

    #[test]
    fn decoder_strips_banner_then_emits_frames() {
        let mut dec = FrameDecoder::new();
        dec.extend(b"Asterisk Call Manager/5.0.2\r\n");
        assert!(dec.next_frame().unwrap().is_none());
        dec.extend(b"Response: Success\r\nActionID: 1\r\nMessage: Authentication accepted\r\n\r\n");
        let frame = dec.next_frame().unwrap().unwrap();
        match frame {
            AmiFrame::Response(resp) => {
                assert!(resp.is_success());
                assert_eq!(resp.action_id(), Some("1"));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn decoder_handles_split_and_back_to_back_frames() {
        let mut dec = FrameDecoder::new();
        dec.extend(b"Asterisk Call Manager/5.0.2\r\nEvent: Newchannel\r\nChan");
        assert!(dec.next_frame().unwrap().is_none());
        dec.extend(b"nel: PJSIP/1016-0000002a\r\n\r\nEvent: Hangup\r\nChannel: PJSIP/1016-0000002a\r\nCause: 16\r\n\r\n");

        let first = dec.next_frame().unwrap().unwrap();
        match first {
            AmiFrame::Event(ev) => {
                assert_eq!(ev.name, "Newchannel");
                assert_eq!(ev.fields.get("Channel"), Some("PJSIP/1016-0000002a"));
            }
            other => panic!("expected event, got {:?}", other),
        }
        let second = dec.next_frame().unwrap().unwrap();
        match second {
            AmiFrame::Event(ev) => {
                assert_eq!(ev.name, "Hangup");
                assert_eq!(ev.fields.get("Cause"), Some("16"));
            }
            other => panic!("expected event, got {:?}", other),
        }
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn field_lookup_is_case_insensitive() {
        let fields = Fields::from_pairs(&[("Uniqueid", "171234.56"), ("CallerIDNum", "1016")]);
        assert_eq!(fields.get("UniqueID"), Some("171234.56"));
        assert_eq!(fields.get("calleridnum"), Some("1016"));
        assert_eq!(fields.get("Missing"), None);
    }

    #[test]
    fn error_response_is_not_success() {
        let mut dec = FrameDecoder::new();
        dec.extend(b"Asterisk Call Manager/5.0.2\r\n");
        let _ = dec.next_frame();
        dec.extend(b"Response: Error\r\nMessage: Interface not found\r\n\r\n");
        match dec.next_frame().unwrap().unwrap() {
            AmiFrame::Response(resp) => {
                assert!(!resp.is_success());
                assert_eq!(resp.message(), "Interface not found");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }
}
