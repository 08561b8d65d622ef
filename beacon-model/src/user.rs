//! Current-user identity as delivered by READY and USER_UPDATE.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The authenticated account's identity fields.
///
/// Only the fields the bridge re-serves (the rich-presence READY envelope)
/// or logs are kept; the remainder of the gateway's user object is dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub avatar_decoration_data: Option<Value>,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub flags: Option<u64>,
    #[serde(default)]
    pub premium_type: Option<u8>,
}
