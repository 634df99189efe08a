use axum::{
    Router, middleware,
    routing::{delete, get, patch, post},
};

use crate::middleware::require_auth;
use crate::state::AppState;
use crate::{chats, messages};

/// Authenticated chat and message routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chats", post(chats::create_chat))
        .route("/chats/{chat_id}", get(chats::get_chat))
        .route("/chats/{chat_id}/members/me", delete(chats::leave_chat))
        .route(
            "/chats/{chat_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/chats/{chat_id}/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route("/chats/{chat_id}/read", post(messages::mark_read))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}
