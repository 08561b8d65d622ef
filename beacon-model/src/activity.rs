//! Activity types carried in presence payloads.
//!
//! Rich-presence clients send activities as loosely shaped JSON; only the
//! fields this bridge rewrites are typed, everything else rides along in
//! `extra` untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Activity type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ActivityType {
    /// Playing {name}
    Playing,
    /// Streaming {name}
    Streaming,
    /// Listening to {name}
    Listening,
    /// Watching {name}
    Watching,
    /// {emoji} {name}
    Custom,
    /// Competing in {name}
    Competing,
}

impl From<u8> for ActivityType {
    fn from(value: u8) -> Self {
        match value {
            0 => ActivityType::Playing,
            1 => ActivityType::Streaming,
            2 => ActivityType::Listening,
            3 => ActivityType::Watching,
            4 => ActivityType::Custom,
            5 => ActivityType::Competing,
            _ => ActivityType::Playing,
        }
    }
}

impl From<ActivityType> for u8 {
    fn from(value: ActivityType) -> Self {
        match value {
            ActivityType::Playing => 0,
            ActivityType::Streaming => 1,
            ActivityType::Listening => 2,
            ActivityType::Watching => 3,
            ActivityType::Custom => 4,
            ActivityType::Competing => 5,
        }
    }
}

/// Start/end timestamps of an activity.
///
/// Clients send these in seconds; the wire format wants milliseconds. The
/// rich-presence server performs that conversion during normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityTimestamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<Number>,
}

/// Out-of-band activity metadata (currently only button targets).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetadata {
    pub button_urls: Vec<String>,
}

/// One element of the presence payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<ActivityTimestamps>,

    /// Asset references by role (`large_image`, `small_text`, ...). Values
    /// arrive as asset names or URLs and leave as asset ids or `mp:` paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<Map<String, Value>>,

    /// `[{label, url}]` from the client, `[label, ...]` on the wire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buttons: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ActivityMetadata>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub emoji: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Activity {
    /// Activity synthesized for a detected game.
    pub fn playing(application_id: impl Into<String>, name: impl Into<String>, start_ms: u64) -> Self {
        Self {
            name: Some(name.into()),
            kind: Some(ActivityType::Playing.into()),
            application_id: Some(application_id.into()),
            timestamps: Some(ActivityTimestamps {
                start: Some(Number::from(start_ms)),
                end: None,
            }),
            ..Self::default()
        }
    }
}

/// Compact projection of another client's activity, kept from
/// SESSIONS_REPLACE for front ends that display the account's own status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusActivity {
    #[serde(rename = "type")]
    pub kind: u8,
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub details: String,
    pub small_text: Option<String>,
    pub large_text: Option<String>,
}
