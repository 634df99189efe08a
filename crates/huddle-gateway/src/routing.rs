use uuid::Uuid;

use huddle_types::events::{GatewayCommand, GatewayEvent, Room};

use crate::credentials::Identity;

/// What the relay does with one inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Join(Uuid),
    Leave(Uuid),
    Publish {
        rooms: Vec<Room>,
        event: GatewayEvent,
        /// Whether the issuing connection gets its own copy.
        include_sender: bool,
    },
}

impl Route {
    fn to_chat(chat_id: Uuid, event: GatewayEvent) -> Self {
        Route::Publish {
            rooms: vec![Room::Chat(chat_id)],
            event,
            include_sender: false,
        }
    }
}

/// Map a client command to its relay action. Payloads are forwarded as
/// received; only typing and read events are stamped with the connection's
/// identity.
pub fn route(cmd: GatewayCommand, sender: &Identity) -> Route {
    match cmd {
        GatewayCommand::Join { chat_id } => Route::Join(chat_id),
        GatewayCommand::Leave { chat_id } => Route::Leave(chat_id),

        GatewayCommand::Typing { chat_id, display_name } => Route::to_chat(
            chat_id,
            GatewayEvent::UserTyping {
                chat_id,
                user_id: sender.user_id,
                username: display_name,
            },
        ),
        GatewayCommand::StopTyping { chat_id, display_name } => Route::to_chat(
            chat_id,
            GatewayEvent::UserStopTyping {
                chat_id,
                user_id: sender.user_id,
                username: display_name,
            },
        ),

        GatewayCommand::MessageSent(message) => {
            Route::to_chat(message.chat_id, GatewayEvent::NewMessage(message))
        }
        GatewayCommand::MessageEdit(message) => {
            Route::to_chat(message.chat_id, GatewayEvent::EditedMessage(message))
        }
        GatewayCommand::MessageDelete(deleted) => {
            Route::to_chat(deleted.chat_id, GatewayEvent::DeletedMessage(deleted))
        }

        // The reader's other devices need this too
        GatewayCommand::MessageRead { message_id, chat_id } => Route::Publish {
            rooms: vec![Room::Chat(chat_id)],
            event: GatewayEvent::MessageReadBy {
                message_id,
                chat_id,
                reader_id: sender.user_id,
            },
            include_sender: true,
        },

        GatewayCommand::ChatCreate { chat, member_ids } => {
            let mut rooms: Vec<Room> = member_ids.into_iter().map(Room::User).collect();
            rooms.dedup();
            Route::Publish {
                rooms,
                event: GatewayEvent::ChatCreated(chat),
                include_sender: true,
            }
        }

        GatewayCommand::ChatUpdate { chat_id, chat } => {
            Route::to_chat(chat_id, GatewayEvent::ChatUpdated { chat_id, chat })
        }
        GatewayCommand::PromoteMember { chat_id, member } => {
            Route::to_chat(chat_id, GatewayEvent::PromotedMember { chat_id, member })
        }
        GatewayCommand::DeleteMember { chat_id, member } => {
            Route::to_chat(chat_id, GatewayEvent::DeletedMember { chat_id, member })
        }
        GatewayCommand::AddMembers { chat_id, members } => {
            Route::to_chat(chat_id, GatewayEvent::AddedMembers { chat_id, members })
        }
        GatewayCommand::LeaveMember { chat_id, member } => {
            Route::to_chat(chat_id, GatewayEvent::LeftMember { chat_id, member })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use huddle_types::models::{Chat, DeletedMessage};

    fn identity() -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            username: "ada".into(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn typing_is_stamped_with_connection_identity() {
        let me = identity();
        let chat_id = Uuid::new_v4();
        let route = route(
            GatewayCommand::Typing {
                chat_id,
                display_name: "Ada L.".into(),
            },
            &me,
        );
        assert_eq!(
            route,
            Route::Publish {
                rooms: vec![Room::Chat(chat_id)],
                event: GatewayEvent::UserTyping {
                    chat_id,
                    user_id: me.user_id,
                    username: "Ada L.".into(),
                },
                include_sender: false,
            }
        );
    }

    #[test]
    fn read_receipts_echo_to_sender() {
        let me = identity();
        let (message_id, chat_id) = (Uuid::new_v4(), Uuid::new_v4());
        let Route::Publish { event, include_sender, .. } =
            route(GatewayCommand::MessageRead { message_id, chat_id }, &me)
        else {
            panic!("read should publish");
        };
        assert!(include_sender);
        assert_eq!(
            event,
            GatewayEvent::MessageReadBy {
                message_id,
                chat_id,
                reader_id: me.user_id,
            }
        );
    }

    #[test]
    fn deletes_go_to_the_chat_room_only() {
        let chat_id = Uuid::new_v4();
        let deleted = DeletedMessage {
            id: Uuid::new_v4(),
            chat_id,
        };
        let Route::Publish { rooms, include_sender, .. } =
            route(GatewayCommand::MessageDelete(deleted), &identity())
        else {
            panic!("delete should publish");
        };
        assert_eq!(rooms, vec![Room::Chat(chat_id)]);
        assert!(!include_sender);
    }

    #[test]
    fn chat_creation_targets_member_rooms() {
        let members = vec![Uuid::new_v4(), Uuid::new_v4()];
        let chat = Chat {
            id: Uuid::new_v4(),
            is_group: false,
            name: None,
            image: None,
            last_message: None,
            last_message_at: None,
            created_at: Utc::now(),
        };
        let Route::Publish { rooms, .. } = route(
            GatewayCommand::ChatCreate {
                chat,
                member_ids: members.clone(),
            },
            &identity(),
        ) else {
            panic!("chat creation should publish");
        };
        assert_eq!(rooms, members.into_iter().map(Room::User).collect::<Vec<_>>());
    }
}
