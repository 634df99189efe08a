use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use huddle_db::Database;

/// Membership lookup the relay consults before admitting a join.
pub trait MembershipCheck: Send + Sync {
    fn has_member(&self, chat_id: Uuid, user_id: Uuid) -> anyhow::Result<bool>;
}

impl MembershipCheck for Database {
    fn has_member(&self, chat_id: Uuid, user_id: Uuid) -> anyhow::Result<bool> {
        self.is_member(&chat_id.to_string(), &user_id.to_string())
    }
}

/// Who may subscribe to a chat room.
#[derive(Clone, Default)]
pub enum JoinPolicy {
    /// Any authenticated connection may join any chat room.
    #[default]
    Open,
    /// Only current members of the chat may join its room.
    MembersOnly(Arc<dyn MembershipCheck>),
}

impl fmt::Debug for JoinPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("Open"),
            Self::MembersOnly(_) => f.write_str("MembersOnly"),
        }
    }
}

impl JoinPolicy {
    pub async fn admits(&self, chat_id: Uuid, user_id: Uuid) -> anyhow::Result<bool> {
        match self {
            Self::Open => Ok(true),
            Self::MembersOnly(check) => {
                let check = check.clone();
                tokio::task::spawn_blocking(move || check.has_member(chat_id, user_id)).await?
            }
        }
    }
}
