//! Notification domain types, the reconciling store, and the unread signal.
//!
//! # Wire format
//!
//! Notifications arrive from two sources with the same JSON shape: the bulk
//! `GET /pushs` response and push `MESSAGE` frames.
//!
//! ```json
//! { "id": 17, "type": "COMMENT", "content": "...", "postId": 4,
//!   "confirmed": false, "createdAt": "2024-11-20T12:34:56" }
//! ```
//!
//! `createdAt` is accepted either as RFC 3339 or as a zone-less local
//! timestamp, which is read as UTC.

pub mod store;
pub mod unread;

pub use store::NotificationStateStore;
pub use unread::{UnreadSignal, UnreadState};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SyncError;

/// Server-assigned notification identifier.
pub type NotificationId = i64;

/// A single notification for the current member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Unique, server-assigned id.
    pub id: NotificationId,
    /// Notification category (e.g. `"COMMENT"`, `"FOLLOW"`).
    #[serde(default, alias = "type")]
    pub kind: String,
    /// Human-readable text.
    #[serde(default, alias = "content", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Post this notification points at, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<i64>,
    /// Whether the member has read it. Only ever flips false → true.
    #[serde(default)]
    pub confirmed: bool,
    /// Server creation time.
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Parse a push payload.
    pub fn from_payload(payload: &str) -> Result<Self, SyncError> {
        serde_json::from_str(payload).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    /// Client route for the notification target, e.g. `/posts/4`.
    pub fn target_route(&self) -> Option<String> {
        self.post_id.map(|id| format!("/posts/{id}"))
    }
}

/// Envelope of the bulk `GET /pushs` response.
///
/// Entries stay raw JSON until [`NotificationList::into_notifications`], so
/// one malformed element costs that element only.
#[derive(Debug, Deserialize)]
pub struct NotificationList {
    /// Notifications for the member; absent means none.
    #[serde(default)]
    pub data: Option<Vec<serde_json::Value>>,
}

impl NotificationList {
    /// Decode every well-formed entry, dropping the rest with a warning.
    pub fn into_notifications(self) -> Vec<Notification> {
        self.data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<Notification>(raw) {
                Ok(notification) => Some(notification),
                Err(e) => {
                    log::warn!("[Api] Dropping malformed notification: {e}");
                    None
                }
            })
            .collect()
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

/// Parse RFC 3339, falling back to a zone-less timestamp interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
}
