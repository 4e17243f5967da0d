use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Numeric user identifier as issued by the storefront backend.
pub type UserId = i64;

// --- Identifiers ---

/// Accepts either a JSON string or a JSON number and yields a `String`.
///
/// The broker serializes database keys as numbers while clients address
/// conversations by string, so both spellings must decode to the same key.
pub fn flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Uint(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Uint(n) => n.to_string(),
    })
}

/// Accepts RFC 3339, a zone-less local timestamp (read as UTC), or epoch millis.
pub fn flexible_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Millis(i64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
                return Ok(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| Utc.from_utc_datetime(&naive))
                .map_err(serde::de::Error::custom)
        }
        Raw::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
    }
}

// --- Chat ---

/// Author of a chat message or member of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SenderRef {
    pub user_id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A chat message as delivered on a conversation topic or returned by the
/// message history API.
///
/// `is_mine` is never read off the wire; the frame router computes it from
/// the local user id before the message reaches any consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    #[serde(deserialize_with = "flexible_id")]
    pub conversation_id: String,
    pub sender: SenderRef,
    pub message: String,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub created_date: DateTime<Utc>,
    /// Optional discriminator; absent on ordinary chat messages.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_deserializing, default)]
    pub is_mine: bool,
}

impl ChatMessage {
    /// Sender id shortcut used for identity tagging.
    pub fn sender_id(&self) -> UserId {
        self.sender.user_id
    }
}

/// Delete notice pushed on a conversation topic: `{"type":"DELETE","messageId":…}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNotice {
    #[serde(deserialize_with = "flexible_id")]
    pub message_id: String,
}

/// Discriminator value that marks a delete notice.
pub const DELETE_FRAME_TYPE: &str = "DELETE";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationType {
    Direct,
    Group,
}

/// Conversation metadata. Delivered on the user inbox topic when a
/// conversation is created or changes, and listed by the conversations API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationInfo {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<ConversationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Vec<SenderRef>,
}

// --- Outbound payloads ---

/// Body published to the send-message destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub conversation_id: String,
    pub message: String,
}

/// Body published to the delete-message destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessageBody {
    pub message_id: String,
}

/// Body published to the create-conversation destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub participant_ids: Vec<UserId>,
}

// --- REST ---

/// Page envelope returned by the paginated read APIs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    #[serde(default)]
    pub total_elements: u64,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub number: u32,
}
