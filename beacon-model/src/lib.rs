//! Core types for the Beacon presence bridge.
//!
//! This crate holds the data model shared by the gateway session, the local
//! rich-presence server, and the game-detection service: activities and the
//! presence payload, the current user's identity, the projected user-settings
//! tree, and the concurrent activity table both producers publish into.

mod activity;
mod presence;
pub mod proto;
mod settings;
mod table;
mod user;

pub use activity::{
    Activity, ActivityMetadata, ActivityTimestamps, ActivityType, StatusActivity,
};
pub use presence::{CustomStatusEmoji, PresenceUpdate, Status};
pub use settings::{CustomStatus, StatusSettings, UserSettings};
pub use table::ActivityTable;
pub use user::OwnUser;
