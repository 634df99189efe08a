//! Rules governing message creation and mutation.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// How long after creation the author may still edit a message.
pub const EDIT_WINDOW_SECS: i64 = 5 * 60;

pub const MAX_CONTENT_CHARS: usize = 4000;

pub fn edit_window() -> Duration {
    Duration::seconds(EDIT_WINDOW_SECS)
}

/// Trimmed content for a new message. Empty text is fine as long as the
/// message carries at least one attachment.
pub fn creation_content(raw: Option<&str>, attachment_count: usize) -> ApiResult<String> {
    let content = raw.map(str::trim).unwrap_or_default();
    if content.is_empty() && attachment_count == 0 {
        return Err(ApiError::validation("message needs text or an attachment"));
    }
    check_length(content)?;
    Ok(content.to_string())
}

/// Trimmed replacement content for an edit.
pub fn edited_content(raw: &str) -> ApiResult<String> {
    let content = raw.trim();
    if content.is_empty() {
        return Err(ApiError::validation("edited content cannot be empty"));
    }
    check_length(content)?;
    Ok(content.to_string())
}

fn check_length(content: &str) -> ApiResult<()> {
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::validation(format!(
            "message exceeds {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(())
}

/// The facts about a stored message that decide whether it may be edited.
#[derive(Debug, Clone, Copy)]
pub struct EditCandidate {
    pub sender_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub attachment_count: usize,
}

pub fn check_edit(candidate: &EditCandidate, editor: Uuid, now: DateTime<Utc>) -> ApiResult<()> {
    if candidate.sender_id != editor {
        return Err(ApiError::forbidden("only the author can edit a message"));
    }
    if now - candidate.created_at > edit_window() {
        return Err(ApiError::validation("messages can only be edited within 5 minutes"));
    }
    if candidate.attachment_count > 0 {
        return Err(ApiError::validation("messages with attachments cannot be edited"));
    }
    Ok(())
}

pub fn check_delete(sender_id: Uuid, deleter: Uuid) -> ApiResult<()> {
    if sender_id != deleter {
        return Err(ApiError::forbidden("only the author can delete a message"));
    }
    Ok(())
}
