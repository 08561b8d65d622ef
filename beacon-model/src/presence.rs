//! Presence payload pieces sent to the gateway.

use crate::Activity;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// User status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Online,
    Idle,
    Dnd,
    Invisible,
    Offline,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Online => "online",
            Status::Idle => "idle",
            Status::Dnd => "dnd",
            Status::Invisible => "invisible",
            Status::Offline => "offline",
        }
    }

    /// Parse a settings-provided status string, defaulting to online.
    pub fn parse(value: &str) -> Self {
        match value {
            "idle" => Status::Idle,
            "dnd" => Status::Dnd,
            "invisible" => Status::Invisible,
            "offline" => Status::Offline,
            _ => Status::Online,
        }
    }
}

/// Emoji attached to a custom status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomStatusEmoji {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub animated: bool,
}

/// Presence update payload (opcode 3 data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub status: Status,
    pub afk: bool,
    pub since: u64,
    pub activities: Vec<Activity>,
}

impl PresenceUpdate {
    /// Assemble the full activity list: the custom status first, then
    /// everything the activity tables contributed.
    pub fn new(
        status: Status,
        custom_status: Option<&str>,
        custom_status_emoji: Option<&CustomStatusEmoji>,
        activities: Vec<Activity>,
        afk: bool,
    ) -> Self {
        let mut all = Vec::with_capacity(activities.len() + 1);
        if let Some(text) = custom_status {
            let mut custom = Activity {
                name: Some("Custom Status".to_string()),
                kind: Some(4),
                state: Some(text.to_string()),
                ..Activity::default()
            };
            if let Some(emoji) = custom_status_emoji {
                custom.emoji = Some(json!(emoji));
            }
            all.push(custom);
        }
        all.extend(activities);
        Self {
            status,
            afk,
            since: 0,
            activities: all,
        }
    }
}
