//! Settings-blob codec.
//!
//! The platform delivers account settings as a base64 protobuf blob. The
//! schema is large; only the status subtree is mirrored here, with field
//! numbers matching the platform's published descriptors. Unknown fields are
//! skipped by the decoder, so the partial mirror stays forward-compatible.

use crate::{CustomStatus, StatusSettings, UserSettings};
use prost::Message;

/// `google.protobuf.StringValue`.
#[derive(Clone, PartialEq, Message)]
pub struct StringValue {
    #[prost(string, tag = "1")]
    pub value: String,
}

/// Custom-status message inside the status settings.
#[derive(Clone, PartialEq, Message)]
pub struct CustomStatusProto {
    #[prost(string, tag = "1")]
    pub text: String,
    #[prost(fixed64, tag = "2")]
    pub emoji_id: u64,
    #[prost(string, tag = "3")]
    pub emoji_name: String,
    #[prost(fixed64, tag = "4")]
    pub expires_at_ms: u64,
}

/// Status subtree of the preloaded settings.
#[derive(Clone, PartialEq, Message)]
pub struct StatusSettingsProto {
    #[prost(message, optional, tag = "1")]
    pub status: Option<StringValue>,
    #[prost(message, optional, tag = "2")]
    pub custom_status: Option<CustomStatusProto>,
}

/// Top-level preloaded settings, reduced to the subtree the bridge reads.
#[derive(Clone, PartialEq, Message)]
pub struct PreloadedUserSettings {
    #[prost(message, optional, tag = "11")]
    pub status: Option<StatusSettingsProto>,
}

/// Decode a raw settings blob into the projected [`UserSettings`].
pub fn decode_preloaded(bytes: &[u8]) -> Result<UserSettings, prost::DecodeError> {
    let decoded = PreloadedUserSettings::decode(bytes)?;
    Ok(UserSettings {
        status: decoded.status.map(|status| StatusSettings {
            status: status.status.map(|wrapped| wrapped.value),
            custom_status: status.custom_status.map(|custom| CustomStatus {
                text: (!custom.text.is_empty()).then(|| custom.text.clone()),
                emoji_id: (custom.emoji_id != 0).then(|| custom.emoji_id.to_string()),
                emoji_name: (!custom.emoji_name.is_empty()).then(|| custom.emoji_name.clone()),
                animated: false,
            }),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Status;

    #[test]
    fn test_decode_status_subtree() {
        let blob = PreloadedUserSettings {
            status: Some(StatusSettingsProto {
                status: Some(StringValue {
                    value: "idle".to_string(),
                }),
                custom_status: Some(CustomStatusProto {
                    text: "brb".to_string(),
                    emoji_id: 0,
                    emoji_name: "🍵".to_string(),
                    expires_at_ms: 0,
                }),
            }),
        };
        let settings = decode_preloaded(&blob.encode_to_vec()).unwrap();
        let (status, text, emoji) = settings.presence_parts();
        assert_eq!(status, Status::Idle);
        assert_eq!(text.as_deref(), Some("brb"));
        assert_eq!(emoji.unwrap().name.as_deref(), Some("🍵"));
    }

    #[test]
    fn test_decode_empty_blob() {
        let settings = decode_preloaded(&[]).unwrap();
        assert!(!settings.has_status());
    }

    #[test]
    fn test_numeric_emoji_id_stringified() {
        let blob = PreloadedUserSettings {
            status: Some(StatusSettingsProto {
                status: Some(StringValue {
                    value: "online".to_string(),
                }),
                custom_status: Some(CustomStatusProto {
                    text: String::new(),
                    emoji_id: 123456789,
                    emoji_name: String::new(),
                    expires_at_ms: 0,
                }),
            }),
        };
        let settings = decode_preloaded(&blob.encode_to_vec()).unwrap();
        let custom = settings.status.unwrap().custom_status.unwrap();
        assert_eq!(custom.emoji_id.as_deref(), Some("123456789"));
        assert!(custom.text.is_none());
    }
}
