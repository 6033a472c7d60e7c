//! Wire codec for the multicast control channel.
//!
//! Every frame is a UTF-8 JSON `COMMAND` envelope wrapping one payload. The
//! numeric action ids are wire-stable; renaming a variant must not change its
//! id. Because the same frame can arrive on several interfaces, receivers
//! run every decoded payload through [`DedupCache`] before dispatching it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Upper bound on processed message ids kept for duplicate suppression.
pub const DEDUP_CAPACITY: usize = 1024;
/// Ids older than this are forgotten even when the cache is not full.
pub const DEDUP_EXPIRY: Duration = Duration::from_secs(600);

/// Control-channel actions with wire-stable numeric ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Action {
    BadChannelQualityIndex = 0,
    ChannelQualityReport = 1,
    OperatingFrequency = 2,
    SwitchFrequency = 3,
}

impl Action {
    /// Human-readable action name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Action::BadChannelQualityIndex => "bad_channel_quality_index",
            Action::ChannelQualityReport => "channel_quality_report",
            Action::OperatingFrequency => "operating_frequency",
            Action::SwitchFrequency => "switch_frequency",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(id: u8) -> std::result::Result<Self, String> {
        match id {
            0 => Ok(Action::BadChannelQualityIndex),
            1 => Ok(Action::ChannelQualityReport),
            2 => Ok(Action::OperatingFrequency),
            3 => Ok(Action::SwitchFrequency),
            other => Err(format!("unknown action id {other}")),
        }
    }
}

/// Payload of a control message.
///
/// `qual` and the traffic counters are only meaningful for BCQI alerts and
/// channel-quality reports; they are omitted from the frame otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub a_id: Action,
    pub message_id: Uuid,
    pub device: String,
    pub freq: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qual: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_rate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phy_error: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_timeout: Option<u64>,
}

/// Framed control message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub msg_type: String,
    pub payload: Payload,
}

pub const MSG_TYPE_COMMAND: &str = "COMMAND";

impl ControlMessage {
    pub fn command(payload: Payload) -> Self {
        ControlMessage {
            msg_type: MSG_TYPE_COMMAND.to_string(),
            payload,
        }
    }
}

/// Measured channel conditions attached to quality-bearing messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelObservation {
    pub quality: u32,
    pub tx_rate: u64,
    pub phy_error: u64,
    pub tx_timeout: u64,
}

impl Payload {
    fn new(a_id: Action, device: &str, freq: u32) -> Self {
        Payload {
            a_id,
            message_id: Uuid::new_v4(),
            device: device.to_string(),
            freq,
            qual: None,
            tx_rate: None,
            phy_error: None,
            tx_timeout: None,
        }
    }

    /// BCQI alert: the operating frequency scored above the threshold.
    pub fn bcqi(device: &str, freq: u32, obs: ChannelObservation) -> Self {
        let mut payload = Payload::new(Action::BadChannelQualityIndex, device, freq);
        payload.qual = Some(obs.quality);
        payload.tx_rate = Some(obs.tx_rate);
        payload.phy_error = Some(obs.phy_error);
        payload.tx_timeout = Some(obs.tx_timeout);
        payload
    }

    /// Off-channel scan result for one candidate frequency.
    pub fn quality_report(device: &str, freq: u32, obs: ChannelObservation) -> Self {
        let mut payload = Payload::new(Action::ChannelQualityReport, device, freq);
        payload.qual = Some(obs.quality);
        payload.tx_rate = Some(obs.tx_rate);
        payload.phy_error = Some(obs.phy_error);
        payload.tx_timeout = Some(obs.tx_timeout);
        payload
    }

    /// Periodic orchestrator announcement of the operating frequency.
    pub fn operating_frequency(device: &str, freq: u32) -> Self {
        Payload::new(Action::OperatingFrequency, device, freq)
    }

    /// Orchestrator command to switch to a new frequency.
    pub fn switch_frequency(device: &str, freq: u32) -> Self {
        Payload::new(Action::SwitchFrequency, device, freq)
    }
}

/// Serialize a control message for transmission. Receivers parse JSON, the
/// indentation is not bit-significant.
pub fn encode(message: &ControlMessage) -> Result<String> {
    serde_json::to_string_pretty(message).map_err(|e| Error::Decode(e.to_string()))
}

/// Parse a received frame. Non-UTF-8 data, malformed JSON and quality-bearing
/// payloads without a `qual` field are all decode errors.
pub fn decode(frame: &[u8]) -> Result<ControlMessage> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| Error::Decode(format!("frame is not UTF-8: {e}")))?;
    let message: ControlMessage =
        serde_json::from_str(text).map_err(|e| Error::Decode(e.to_string()))?;
    if message.msg_type != MSG_TYPE_COMMAND {
        return Err(Error::Decode(format!(
            "unexpected msg_type {:?}",
            message.msg_type
        )));
    }
    match message.payload.a_id {
        Action::BadChannelQualityIndex | Action::ChannelQualityReport
            if message.payload.qual.is_none() =>
        {
            Err(Error::Decode(format!(
                "{} payload without qual field",
                message.payload.a_id
            )))
        }
        _ => Ok(message),
    }
}

/// Bounded, time-indexed set of processed message ids.
///
/// The same frame reaches a node once per control-channel interface, so each
/// id must be dispatched at most once. Ids are forgotten after
/// [`DEDUP_EXPIRY`] or when the cache overflows, oldest first.
pub struct DedupCache {
    seen: HashMap<Uuid, Instant>,
    order: VecDeque<Uuid>,
    capacity: usize,
    expiry: Duration,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_limits(DEDUP_CAPACITY, DEDUP_EXPIRY)
    }

    pub fn with_limits(capacity: usize, expiry: Duration) -> Self {
        DedupCache {
            seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            expiry,
        }
    }

    /// Record a message id. Returns `true` when the id is new and the caller
    /// should dispatch the message, `false` for a duplicate.
    pub fn observe(&mut self, id: Uuid, now: Instant) -> bool {
        self.prune(now);
        if self.seen.contains_key(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id, now);
        self.order.push_back(id);
        true
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.order.front() {
            match self.seen.get(oldest) {
                Some(at) if now.duration_since(*at) > self.expiry => {
                    self.seen.remove(oldest);
                    self.order.pop_front();
                }
                _ => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        DedupCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation() -> ChannelObservation {
        ChannelObservation {
            quality: 7,
            tx_rate: 1200,
            phy_error: 42,
            tx_timeout: 1,
        }
    }

    #[test]
    fn action_ids_are_wire_stable() {
        assert_eq!(u8::from(Action::BadChannelQualityIndex), 0);
        assert_eq!(u8::from(Action::ChannelQualityReport), 1);
        assert_eq!(u8::from(Action::OperatingFrequency), 2);
        assert_eq!(u8::from(Action::SwitchFrequency), 3);
        assert_eq!(Action::try_from(3).unwrap(), Action::SwitchFrequency);
        assert!(Action::try_from(4).is_err());
    }

    #[test]
    fn encode_decode_preserves_all_fields() {
        let message = ControlMessage::command(Payload::bcqi("00:11:22:33:44:55", 5200, observation()));
        let frame = encode(&message).unwrap();
        let decoded = decode(frame.as_bytes()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn a_id_is_numeric_on_the_wire() {
        let message = ControlMessage::command(Payload::switch_frequency("aa:bb:cc:dd:ee:ff", 5180));
        let frame = encode(&message).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["payload"]["a_id"], serde_json::json!(3));
        assert_eq!(value["msg_type"], serde_json::json!("COMMAND"));
        // Optional quality fields are omitted for switch commands.
        assert!(value["payload"].get("qual").is_none());
    }

    #[test]
    fn quality_bearing_payload_requires_qual() {
        let frame = r#"{"msg_type":"COMMAND","payload":{
            "a_id":1,"message_id":"a3bb189e-8bf9-3888-9912-ace4e6543002",
            "device":"aa:bb:cc:dd:ee:ff","freq":5180}}"#;
        assert!(decode(frame.as_bytes()).is_err());
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        assert!(decode(&[0xff, 0xfe, 0x00]).is_err());
        assert!(decode(b"{not json").is_err());
    }

    #[test]
    fn dedup_suppresses_repeated_ids() {
        let mut cache = DedupCache::new();
        let id = Uuid::new_v4();
        let now = Instant::now();
        assert!(cache.observe(id, now));
        assert!(!cache.observe(id, now));
        assert!(cache.observe(Uuid::new_v4(), now));
    }

    #[test]
    fn dedup_expires_old_ids() {
        let mut cache = DedupCache::with_limits(16, Duration::from_secs(10));
        let id = Uuid::new_v4();
        let start = Instant::now();
        assert!(cache.observe(id, start));
        // Within the expiry window the id is still a duplicate.
        assert!(!cache.observe(id, start + Duration::from_secs(9)));
        // Past the window it is treated as new again.
        assert!(cache.observe(id, start + Duration::from_secs(30)));
    }

    #[test]
    fn dedup_is_bounded() {
        let mut cache = DedupCache::with_limits(4, Duration::from_secs(600));
        let now = Instant::now();
        let first = Uuid::new_v4();
        assert!(cache.observe(first, now));
        for _ in 0..4 {
            assert!(cache.observe(Uuid::new_v4(), now));
        }
        assert_eq!(cache.len(), 4);
        // The oldest id was evicted and would be dispatched again.
        assert!(cache.observe(first, now));
    }
}
