//! Record types stored in the document database.
//!
//! Source documents are loosely typed: most fields may be missing. Every such
//! field is an `Option`, and display helpers resolve the fallbacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::{
    CHAT_COLLECTION, CLIENT_COLLECTION, NOTIFICATION_COLLECTION, POST_PRODUCTION_COLLECTION,
    PROJECT_COLLECTION, SCRIPT_COLLECTION, USER_COLLECTION, VIDEO_COLLECTION,
};

/// Tolerant timestamp decoding.
///
/// Timestamps written with the server sentinel read back as the sentinel (or
/// not at all) until the commit resolves, so anything that is not a parseable
/// RFC 3339 string or epoch-millis number decodes to `None`.
pub mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(parse))
    }

    /// Parse a stored timestamp value.
    pub fn parse(value: &Value) -> Option<DateTime<Utc>> {
        match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Value::Number(n) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            _ => None,
        }
    }
}

/// Authenticated identity. Persisted locally across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: String,
}

/// A team member profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl UserProfile {
    pub const COLLECTION: &'static str = USER_COLLECTION;

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.email.as_deref())
            .unwrap_or("Unknown")
    }

    /// Build the session for this profile.
    pub fn to_session(&self) -> Session {
        Session {
            id: self.id.clone(),
            email: self.email.clone().unwrap_or_default(),
            name: self.display_name().to_string(),
            role: self.role.clone().unwrap_or_else(|| "member".to_string()),
        }
    }
}

/// A production project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "timestamp::deserialize"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl Project {
    pub const COLLECTION: &'static str = PROJECT_COLLECTION;

    pub fn display_name(&self) -> &str {
        non_empty(&self.name).unwrap_or("Untitled Project")
    }
}

/// A video deliverable under a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "timestamp::deserialize"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl Video {
    pub const COLLECTION: &'static str = VIDEO_COLLECTION;

    /// `videoName`, then `product`, then "Untitled".
    pub fn display_title(&self) -> &str {
        non_empty(&self.video_name)
            .or_else(|| non_empty(&self.product))
            .unwrap_or("Untitled")
    }
}

/// A script, optionally linked to a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "timestamp::deserialize"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl Script {
    pub const COLLECTION: &'static str = SCRIPT_COLLECTION;

    pub fn display_title(&self) -> &str {
        non_empty(&self.title).unwrap_or("Untitled Script")
    }
}

/// A studio client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "timestamp::deserialize"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl Client {
    pub const COLLECTION: &'static str = CLIENT_COLLECTION;

    pub fn display_name(&self) -> &str {
        non_empty(&self.name)
            .or_else(|| non_empty(&self.company))
            .unwrap_or("Unnamed Client")
    }
}

/// A post-production assignment (edit, color, sound) for a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostProduction {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "timestamp::deserialize"
    )]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "timestamp::deserialize"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl PostProduction {
    pub const COLLECTION: &'static str = POST_PRODUCTION_COLLECTION;

    /// `title`, then the linked video's name, then "Untitled".
    pub fn display_title(&self) -> &str {
        non_empty(&self.title)
            .or_else(|| non_empty(&self.video_name))
            .unwrap_or("Untitled")
    }
}

/// A per-user notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "timestamp::deserialize"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    pub const COLLECTION: &'static str = NOTIFICATION_COLLECTION;
}

/// A user mentioned in a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub user_id: String,
    pub user_name: String,
}

/// Entity types that chat messages can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Project,
    Video,
    Script,
    #[serde(alias = "post-production")]
    PostProduction,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 4] = [
        ReferenceKind::Project,
        ReferenceKind::Video,
        ReferenceKind::Script,
        ReferenceKind::PostProduction,
    ];

    /// Internal key, as stored in `references[].type`.
    pub fn key(self) -> &'static str {
        match self {
            ReferenceKind::Project => "project",
            ReferenceKind::Video => "video",
            ReferenceKind::Script => "script",
            ReferenceKind::PostProduction => "postproduction",
        }
    }

    /// Token spelling used in message text (`#post-production:Name`).
    pub fn token(self) -> &'static str {
        match self {
            ReferenceKind::PostProduction => "post-production",
            other => other.key(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ReferenceKind::Project => "Project",
            ReferenceKind::Video => "Video",
            ReferenceKind::Script => "Script",
            ReferenceKind::PostProduction => "Post-Production",
        }
    }

    /// Parse either spelling; the hyphenated form normalizes to the internal key.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "project" => Some(ReferenceKind::Project),
            "video" => Some(ReferenceKind::Video),
            "script" => Some(ReferenceKind::Script),
            "postproduction" | "post-production" => Some(ReferenceKind::PostProduction),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// An entity referenced from a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityReference {
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    pub id: String,
    pub name: String,
}

/// A team chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    #[serde(default)]
    pub references: Vec<EntityReference>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "timestamp::deserialize"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub const COLLECTION: &'static str = CHAT_COLLECTION;
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn video_title_falls_back_through_product() {
        let video: Video = serde_json::from_value(json!({
            "id": "v1",
            "product": "Sneaker Drop"
        }))
        .unwrap();
        assert_eq!(video.display_title(), "Sneaker Drop");

        let bare: Video = serde_json::from_value(json!({ "id": "v2", "videoName": "" })).unwrap();
        assert_eq!(bare.display_title(), "Untitled");
    }

    #[test]
    fn pending_server_timestamp_reads_as_none() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "id": "m1",
            "content": "hi",
            "senderId": "u1",
            "senderName": "Ali",
            "createdAt": { ".sv": "timestamp" }
        }))
        .unwrap();
        assert!(msg.created_at.is_none());
        assert!(msg.mentions.is_empty());
    }

    #[test]
    fn timestamps_accept_rfc3339_and_millis() {
        let a: NotificationRecord = serde_json::from_value(json!({
            "id": "n1",
            "userId": "u1",
            "createdAt": "2026-03-01T10:00:00Z"
        }))
        .unwrap();
        let b: NotificationRecord = serde_json::from_value(json!({
            "id": "n2",
            "userId": "u1",
            "createdAt": 1772359200000i64
        }))
        .unwrap();
        assert_eq!(a.created_at, b.created_at);
        assert!(!a.read);
    }

    #[test]
    fn reference_kind_normalizes_hyphenated_type() {
        assert_eq!(
            ReferenceKind::parse("post-production"),
            Some(ReferenceKind::PostProduction)
        );
        let parsed: EntityReference = serde_json::from_value(json!({
            "type": "post-production",
            "id": "pp1",
            "name": "Color pass"
        }))
        .unwrap();
        assert_eq!(parsed.kind, ReferenceKind::PostProduction);
        assert_eq!(
            serde_json::to_value(&parsed).unwrap()["type"],
            json!("postproduction")
        );
    }
}
