//! Row -> API model conversion. Corrupt identifiers and timestamps are
//! logged and replaced with defaults rather than failing the whole request.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use huddle_db::Database;
use huddle_db::models::{AttachmentRow, ChatRow, MemberRow, MessageRow, ReadRow, ReaderRow};
use huddle_types::models::{
    Attachment, Chat, ChatMember, MediaKind, MemberRole, MessageRecord, ReadReceipt, UserSummary,
};

fn uuid(raw: &str, field: &str, owner: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}' on '{}': {}", field, raw, owner, e);
        Uuid::default()
    })
}

fn time(raw: &str, field: &str, owner: &str) -> DateTime<Utc> {
    huddle_db::parse_timestamp(raw).unwrap_or_else(|| {
        warn!("Corrupt {} '{}' on '{}'", field, raw, owner);
        DateTime::default()
    })
}

pub fn chat(row: ChatRow) -> Chat {
    Chat {
        id: uuid(&row.id, "id", "chat"),
        is_group: row.is_group,
        name: row.name,
        image: row.image,
        last_message: row.last_message,
        last_message_at: row
            .last_message_at
            .as_deref()
            .map(|t| time(t, "last_message_at", &row.id)),
        created_at: time(&row.created_at, "created_at", &row.id),
    }
}

pub fn member(row: MemberRow) -> ChatMember {
    let role = MemberRole::parse(&row.role).unwrap_or_else(|| {
        warn!("Unknown role '{}' for member '{}'", row.role, row.user_id);
        MemberRole::Member
    });
    ChatMember {
        chat_id: uuid(&row.chat_id, "chat_id", &row.user_id),
        user: UserSummary {
            id: uuid(&row.user_id, "user_id", &row.chat_id),
            username: row.username,
            image: row.image,
        },
        role,
        joined_at: time(&row.joined_at, "joined_at", &row.user_id),
    }
}

pub fn reader(row: ReaderRow) -> UserSummary {
    UserSummary {
        id: uuid(&row.user_id, "user_id", "receipt"),
        username: row.username,
        image: row.image,
    }
}

fn attachment(row: AttachmentRow) -> Attachment {
    let kind = MediaKind::parse(&row.kind).unwrap_or_else(|| {
        warn!("Unknown media kind '{}' on attachment '{}'", row.kind, row.id);
        MediaKind::Image
    });
    Attachment {
        id: uuid(&row.id, "id", "attachment"),
        message_id: uuid(&row.message_id, "message_id", &row.id),
        url: row.url,
        kind,
    }
}

fn receipt(row: ReadRow) -> ReadReceipt {
    ReadReceipt {
        message_id: uuid(&row.message_id, "message_id", "receipt"),
        user_id: uuid(&row.user_id, "user_id", &row.message_id),
        read_at: time(&row.read_at, "read_at", &row.message_id),
    }
}

pub fn message(row: MessageRow, attachments: Vec<Attachment>, reads: Vec<ReadReceipt>) -> MessageRecord {
    let sender_id = uuid(&row.sender_id, "sender_id", &row.id);
    MessageRecord {
        id: uuid(&row.id, "id", "message"),
        chat_id: uuid(&row.chat_id, "chat_id", &row.id),
        sender_id,
        sender: UserSummary {
            id: sender_id,
            username: row.sender_username,
            image: row.sender_image,
        },
        content: row.content,
        created_at: time(&row.created_at, "created_at", &row.id),
        edited: row.edited,
        attachments,
        reads,
        client_ref: None,
    }
}

/// Attach attachments and receipts to message rows, preserving row order.
/// Runs on a blocking thread.
pub fn hydrate(db: &Database, rows: Vec<MessageRow>) -> anyhow::Result<Vec<MessageRecord>> {
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

    let mut attachments: HashMap<String, Vec<Attachment>> = HashMap::new();
    for row in db.get_attachments_for_messages(&ids)? {
        attachments.entry(row.message_id.clone()).or_default().push(attachment(row));
    }

    let mut reads: HashMap<String, Vec<ReadReceipt>> = HashMap::new();
    for row in db.get_reads_for_messages(&ids)? {
        reads.entry(row.message_id.clone()).or_default().push(receipt(row));
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let a = attachments.remove(&row.id).unwrap_or_default();
            let r = reads.remove(&row.id).unwrap_or_default();
            message(row, a, r)
        })
        .collect())
}

/// Load and hydrate a single message.
pub fn load_message(db: &Database, id: &str) -> anyhow::Result<Option<MessageRecord>> {
    let Some(row) = db.get_message(id)? else {
        return Ok(None);
    };
    Ok(hydrate(db, vec![row])?.pop())
}
