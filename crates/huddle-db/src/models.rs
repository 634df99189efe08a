/// Database row types, mapped directly from SQLite rows.
/// Distinct from huddle-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub image: Option<String>,
    pub created_at: String,
}

pub struct ChatRow {
    pub id: String,
    pub is_group: bool,
    pub name: Option<String>,
    pub image: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<String>,
    pub created_at: String,
}

pub struct MemberRow {
    pub chat_id: String,
    pub user_id: String,
    pub username: String,
    pub image: Option<String>,
    pub role: String,
    pub joined_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub sender_image: Option<String>,
    pub content: String,
    pub created_at: String,
    pub edited: bool,
}

pub struct AttachmentRow {
    pub id: String,
    pub message_id: String,
    pub url: String,
    pub kind: String,
}

pub struct ReadRow {
    pub message_id: String,
    pub user_id: String,
    pub read_at: String,
}

/// A reader of a message joined with their public profile.
pub struct ReaderRow {
    pub user_id: String,
    pub username: String,
    pub image: Option<String>,
    pub read_at: String,
}

// -- Inputs --

pub struct NewChat<'a> {
    pub id: &'a str,
    pub is_group: bool,
    pub name: Option<&'a str>,
    pub image: Option<&'a str>,
    pub created_at: &'a str,
}

pub struct NewMessage<'a> {
    pub id: &'a str,
    pub chat_id: &'a str,
    pub sender_id: &'a str,
    pub content: &'a str,
    pub created_at: &'a str,
}

pub struct NewAttachment {
    pub id: String,
    pub url: String,
    pub kind: String,
}

/// One page of history, newest-last.
pub struct MessagePage {
    pub rows: Vec<MessageRow>,
    /// More messages exist before the first row.
    pub has_more: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    NotMember,
    /// The caller was removed; `promoted` names the member who inherited admin.
    Left { promoted: Option<String> },
    /// The caller was the last member; the chat and its history are gone.
    ChatDeleted,
}
