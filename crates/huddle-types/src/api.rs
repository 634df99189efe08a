use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Chat, ChatMember, MessageRecord, UserSummary};

// -- JWT Claims --

/// Bearer credential claims shared by the REST middleware and the gateway
/// handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- History --

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 200;

/// Query string for `GET /chats/{chat_id}/messages`.
///
/// `limit` is kept as raw text: anything missing, zero or unparsable falls
/// back to the default instead of failing the request.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
    /// Oldest message id already held; the page returned is strictly older.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Uuid>,
    #[serde(default)]
    pub mark_read: bool,
}

impl HistoryQuery {
    pub fn limit(&self) -> u32 {
        clamp_page_limit(self.limit.as_deref())
    }
}

/// Coerce a requested page size into `[1, MAX_PAGE_LIMIT]`.
pub fn clamp_page_limit(raw: Option<&str>) -> u32 {
    let requested = raw
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|n| *n != 0)
        .unwrap_or(DEFAULT_PAGE_LIMIT as i64);
    requested.clamp(1, MAX_PAGE_LIMIT as i64) as u32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Chronologically ascending.
    pub messages: Vec<MessageRecord>,
    /// Cursor for the next older page; `None` once history is exhausted.
    pub next_cursor: Option<Uuid>,
    /// Readers of the newest message in this page, author excluded.
    #[serde(default)]
    pub latest_read_by: Vec<UserSummary>,
    /// Message that received a receipt because `mark_read` was set.
    #[serde(default)]
    pub marked_read: Option<Uuid>,
}

// -- Messages --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentUpload {
    /// Identifier of the already-uploaded resource in the media store.
    pub public_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateMessageRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentUpload>,
    #[serde(default)]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub message_id: Uuid,
}

// -- Chats --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChatRequest {
    pub member_ids: Vec<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Returned by chat creation; the client relays it as `chat_create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatWithMembers {
    pub chat: Chat,
    pub member_ids: Vec<Uuid>,
}

/// `GET /chats/{chat_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDetail {
    pub chat: Chat,
    pub members: Vec<ChatMember>,
}

/// Result of leaving a chat. The client relays `member_leave`, plus
/// `member_promote` when someone inherited the admin role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveResponse {
    pub chat_id: Uuid,
    /// The caller was the last member and the chat is gone.
    pub chat_deleted: bool,
    #[serde(default)]
    pub promoted: Option<ChatMember>,
}

// -- Errors --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_chat_id: Option<Uuid>,
}
