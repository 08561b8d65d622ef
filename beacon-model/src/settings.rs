//! Projected user-settings tree.
//!
//! The gateway delivers account settings as an opaque protobuf blob (see
//! [`crate::proto`]) or, on legacy hosts, as flat JSON. Either way only the
//! status subtree matters to the bridge; this module is that projection.

use crate::{CustomStatusEmoji, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Custom status contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomStatus {
    pub text: Option<String>,
    pub emoji_id: Option<String>,
    pub emoji_name: Option<String>,
    #[serde(default)]
    pub animated: bool,
}

/// The `status` subtree of the settings blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSettings {
    pub status: Option<String>,
    pub custom_status: Option<CustomStatus>,
}

/// Decoded user settings, reduced to the fields the bridge consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub status: Option<StatusSettings>,
}

impl UserSettings {
    /// Whether the blob carried a usable status subtree.
    pub fn has_status(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| status.status.is_some())
    }

    /// Derive the presence parts the orchestrator publishes: the status,
    /// the custom-status text, and the custom-status emoji. An emoji with
    /// neither id nor name is dropped.
    pub fn presence_parts(&self) -> (Status, Option<String>, Option<CustomStatusEmoji>) {
        let Some(status_settings) = self.status.as_ref() else {
            return (Status::Online, None, None);
        };
        let status = status_settings
            .status
            .as_deref()
            .map(Status::parse)
            .unwrap_or_default();

        let Some(custom) = status_settings.custom_status.as_ref() else {
            return (status, None, None);
        };
        let emoji = if custom.emoji_id.is_some() || custom.emoji_name.is_some() {
            Some(CustomStatusEmoji {
                id: custom.emoji_id.clone(),
                name: custom.emoji_name.clone(),
                animated: custom.animated,
            })
        } else {
            None
        };
        (status, custom.text.clone(), emoji)
    }

    /// Synthesize settings from the flat `user_settings` object that legacy
    /// hosts embed in READY.
    pub fn from_legacy(raw: &Value) -> Self {
        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("online")
            .to_string();
        let custom_status = raw.get("custom_status").and_then(|custom| {
            custom.as_object().map(|fields| CustomStatus {
                text: fields
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                emoji_id: fields
                    .get("emoji_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                emoji_name: fields
                    .get("emoji_name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                animated: fields
                    .get("animated")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        });
        Self {
            status: Some(StatusSettings {
                status: Some(status),
                custom_status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_presence_parts_full() {
        let settings = UserSettings {
            status: Some(StatusSettings {
                status: Some("dnd".to_string()),
                custom_status: Some(CustomStatus {
                    text: Some("busy".to_string()),
                    emoji_id: None,
                    emoji_name: Some("🔥".to_string()),
                    animated: false,
                }),
            }),
        };
        let (status, text, emoji) = settings.presence_parts();
        assert_eq!(status, Status::Dnd);
        assert_eq!(text.as_deref(), Some("busy"));
        assert_eq!(emoji.unwrap().name.as_deref(), Some("🔥"));
    }

    #[test]
    fn test_emoji_without_id_or_name_dropped() {
        let settings = UserSettings {
            status: Some(StatusSettings {
                status: Some("online".to_string()),
                custom_status: Some(CustomStatus {
                    text: Some("hi".to_string()),
                    ..CustomStatus::default()
                }),
            }),
        };
        let (_, text, emoji) = settings.presence_parts();
        assert_eq!(text.as_deref(), Some("hi"));
        assert!(emoji.is_none());
    }

    #[test]
    fn test_empty_settings_default_online() {
        let (status, text, emoji) = UserSettings::default().presence_parts();
        assert_eq!(status, Status::Online);
        assert!(text.is_none());
        assert!(emoji.is_none());
    }

    #[test]
    fn test_from_legacy() {
        let raw = json!({
            "status": "idle",
            "custom_status": {"text": "afk", "emoji_name": "💤"},
            "guild_positions": []
        });
        let settings = UserSettings::from_legacy(&raw);
        assert!(settings.has_status());
        let (status, text, emoji) = settings.presence_parts();
        assert_eq!(status, Status::Idle);
        assert_eq!(text.as_deref(), Some("afk"));
        assert_eq!(emoji.unwrap().name.as_deref(), Some("💤"));
    }
}
