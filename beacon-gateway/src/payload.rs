//! Gateway payload structures.

use crate::opcode::OpCode;
use beacon_model::PresenceUpdate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Capabilities mask sent for user tokens.
pub const DEFAULT_CAPABILITIES: u64 = 30717;

/// Intent mask sent for bot tokens.
pub const DEFAULT_INTENTS: u64 = 50_364_033;

/// A raw payload as received, with `d` left unparsed until dispatch.
#[derive(Debug, Deserialize)]
pub struct RawPayload {
    /// Raw opcode; unknown values are skipped rather than rejected.
    pub op: u8,

    #[serde(default)]
    pub d: Value,

    /// Sequence number (dispatch events only).
    #[serde(default)]
    pub s: Option<u64>,

    /// Event name (dispatch events only).
    #[serde(default)]
    pub t: Option<String>,
}

/// An outgoing payload.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayPayload<D> {
    pub op: OpCode,
    pub d: D,
}

impl<D: Serialize> GatewayPayload<D> {
    pub fn new(op: OpCode, data: D) -> Self {
        Self { op, d: data }
    }
}

/// Hello data (op 10).
#[derive(Debug, Clone, Deserialize)]
pub struct HelloData {
    /// Interval in milliseconds at which to send heartbeats.
    pub heartbeat_interval: u64,
}

/// Identify data (op 2).
///
/// User tokens declare `capabilities`, bot tokens declare `intents`; exactly
/// one of the two is present.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyData<'a> {
    pub token: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub intents: Option<u64>,

    pub properties: &'a Value,

    pub presence: PresenceUpdate,
}

impl<'a> IdentifyData<'a> {
    /// Build identify data for the given token kind. `mask` overrides the
    /// default capabilities/intents when the configuration provides one.
    pub fn new(token: &'a str, mask: Option<u64>, properties: &'a Value) -> Self {
        let bot = token.starts_with("Bot");
        Self {
            token,
            capabilities: (!bot).then(|| mask.unwrap_or(DEFAULT_CAPABILITIES)),
            intents: bot.then(|| mask.unwrap_or(DEFAULT_INTENTS)),
            properties,
            presence: PresenceUpdate::new(Default::default(), None, None, Vec::new(), false),
        }
    }
}

/// Resume data (op 6).
#[derive(Debug, Clone, Serialize)]
pub struct ResumeData<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: Option<u64>,
}

/// Plain heartbeat (op 1): the last seen sequence, or null.
pub fn heartbeat(sequence: Option<u64>) -> String {
    match sequence {
        Some(seq) => format!(r#"{{"op":1,"d":{seq}}}"#),
        None => r#"{"op":1,"d":null}"#.to_string(),
    }
}

/// Heartbeat with the QoS side-channel, used on non-legacy hosts.
pub fn heartbeat_qos(sequence: Option<u64>) -> String {
    json!({
        "op": 1,
        "d": {
            "seq": sequence,
            "qos": {"ver": 26, "active": true, "reason": "foregrounded"},
        },
    })
    .to_string()
}

/// Time-spent analytics event (op 41), sent alongside a heartbeat every
/// thirty minutes.
pub fn time_spent(init_time_ms: f64, heartbeat_session_id: &str, launch_id: &str) -> String {
    json!({
        "op": 41,
        "d": {
            "initialization_timestamp": init_time_ms,
            "session_id": heartbeat_session_id,
            "client_launch_id": launch_id,
        },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_payloads() {
        assert_eq!(heartbeat(Some(42)), r#"{"op":1,"d":42}"#);
        assert_eq!(heartbeat(None), r#"{"op":1,"d":null}"#);

        let qos: Value = serde_json::from_str(&heartbeat_qos(Some(7))).unwrap();
        assert_eq!(qos["d"]["seq"], 7);
        assert_eq!(qos["d"]["qos"]["ver"], 26);
        assert_eq!(qos["d"]["qos"]["reason"], "foregrounded");
    }

    #[test]
    fn test_identify_user_token() {
        let properties = json!({"os": "Linux"});
        let identify = IdentifyData::new("user-token", None, &properties);
        let value = serde_json::to_value(GatewayPayload::new(OpCode::Identify, identify)).unwrap();
        assert_eq!(value["op"], 2);
        assert_eq!(value["d"]["capabilities"], 30717);
        assert!(value["d"].get("intents").is_none());
        assert_eq!(value["d"]["presence"]["status"], "online");
        assert_eq!(value["d"]["presence"]["afk"], false);
    }

    #[test]
    fn test_identify_bot_token_uses_intents() {
        let properties = json!({});
        let identify = IdentifyData::new("Bot abc", Some(515), &properties);
        let value = serde_json::to_value(&identify).unwrap();
        assert_eq!(value["intents"], 515);
        assert!(value.get("capabilities").is_none());
    }

    #[test]
    fn test_raw_payload_tolerates_unknown_opcodes() {
        let raw: RawPayload = serde_json::from_str(r#"{"op":99,"d":{"x":1}}"#).unwrap();
        assert_eq!(raw.op, 99);
        assert!(raw.s.is_none());
    }
}
