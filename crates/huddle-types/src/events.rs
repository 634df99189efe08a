use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Chat, ChatMember, DeletedMessage, MessageRecord};

/// Broadcast group on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Room {
    /// Personal room, joined automatically at handshake.
    User(Uuid),
    /// Conversation room, joined while the chat is the active view.
    Chat(Uuid),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Chat(id) => write!(f, "chat:{}", id),
        }
    }
}

/// Commands sent FROM client TO server over the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Subscribe this connection to `chat:{chat_id}`
    Join { chat_id: Uuid },

    /// Unsubscribe this connection from `chat:{chat_id}`
    Leave { chat_id: Uuid },

    Typing { chat_id: Uuid, display_name: String },

    StopTyping { chat_id: Uuid, display_name: String },

    /// Relay a freshly persisted message to the rest of the room
    MessageSent(MessageRecord),

    /// Relay an edited message
    MessageEdit(MessageRecord),

    /// Relay a removal
    MessageDelete(DeletedMessage),

    /// Announce that this connection's user has read a message
    MessageRead { message_id: Uuid, chat_id: Uuid },

    /// Tell every listed member that a chat now exists
    ChatCreate { chat: Chat, member_ids: Vec<Uuid> },

    ChatUpdate { chat_id: Uuid, chat: Chat },

    PromoteMember { chat_id: Uuid, member: ChatMember },

    DeleteMember { chat_id: Uuid, member: ChatMember },

    AddMembers { chat_id: Uuid, members: Vec<ChatMember> },

    LeaveMember { chat_id: Uuid, member: ChatMember },
}

/// Events sent FROM server TO client over the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Handshake accepted
    Ready {
        user_id: Uuid,
        username: String,
        connection_id: Uuid,
    },

    UserTyping {
        chat_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    UserStopTyping {
        chat_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    NewMessage(MessageRecord),

    EditedMessage(MessageRecord),

    DeletedMessage(DeletedMessage),

    MessageReadBy {
        message_id: Uuid,
        chat_id: Uuid,
        reader_id: Uuid,
    },

    ChatCreated(Chat),

    ChatUpdated { chat_id: Uuid, chat: Chat },

    PromotedMember { chat_id: Uuid, member: ChatMember },

    DeletedMember { chat_id: Uuid, member: ChatMember },

    AddedMembers { chat_id: Uuid, members: Vec<ChatMember> },

    LeftMember { chat_id: Uuid, member: ChatMember },

    /// A command was refused
    Error { code: ErrorCode, message: String },
}

impl GatewayEvent {
    /// Returns the chat this event concerns, if it is chat-scoped.
    pub fn chat_id(&self) -> Option<Uuid> {
        match self {
            Self::UserTyping { chat_id, .. }
            | Self::UserStopTyping { chat_id, .. }
            | Self::MessageReadBy { chat_id, .. }
            | Self::ChatUpdated { chat_id, .. }
            | Self::PromotedMember { chat_id, .. }
            | Self::DeletedMember { chat_id, .. }
            | Self::AddedMembers { chat_id, .. }
            | Self::LeftMember { chat_id, .. } => Some(*chat_id),
            Self::NewMessage(m) | Self::EditedMessage(m) => Some(m.chat_id),
            Self::DeletedMessage(d) => Some(d.chat_id),
            Self::ChatCreated(chat) => Some(chat.id),
            Self::Ready { .. } | Self::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    Validation,
    NotFound,
}

/// Close code the relay uses when a credential expires mid-session.
pub const CLOSE_CREDENTIAL_EXPIRED: u16 = 4001;
