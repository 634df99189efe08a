use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use huddle_db::models::{LeaveOutcome, NewChat};
use huddle_db::timestamp;
use huddle_gateway::credentials::Identity;
use huddle_types::api::{ChatDetail, ChatWithMembers, CreateChatRequest, LeaveResponse};
use huddle_types::models::Chat;

use crate::error::{ApiError, ApiResult};
use crate::messages::authorize_member;
use crate::records;
use crate::state::AppState;

/// Create a direct chat (two members) or a group (three or more). The
/// caller is always a member and becomes the admin.
pub async fn create_chat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateChatRequest>,
) -> ApiResult<(StatusCode, Json<ChatWithMembers>)> {
    let me = identity.user_id;

    let mut member_ids = req.member_ids;
    member_ids.push(me);
    member_ids.sort();
    member_ids.dedup();

    if member_ids.len() < 2 {
        return Err(ApiError::validation("a chat needs at least one other member"));
    }
    let is_group = member_ids.len() >= 3;
    let name = req
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    if is_group && name.is_none() {
        return Err(ApiError::validation("group chats need a name"));
    }

    let db = state.db.clone();
    let image = req.image;
    let members = member_ids.clone();
    let chat = tokio::task::spawn_blocking(move || -> ApiResult<Chat> {
        let member_strs: Vec<String> = members.iter().map(Uuid::to_string).collect();
        for (id, raw) in members.iter().zip(&member_strs) {
            if db.get_user(raw)?.is_none() {
                return Err(ApiError::not_found(format!("user {} not found", id)));
            }
        }

        if !is_group {
            let other = members.iter().find(|id| **id != me).copied().unwrap_or(me);
            if let Some(existing) = db.find_direct_chat(&me.to_string(), &other.to_string())? {
                return Err(ApiError::DuplicateChat(existing.parse().unwrap_or_default()));
            }
        }

        let chat_id = Uuid::new_v4().to_string();
        let now = timestamp(Utc::now());
        db.create_chat(
            &NewChat {
                id: &chat_id,
                is_group,
                name: if is_group { name.as_deref() } else { None },
                image: image.as_deref(),
                created_at: &now,
            },
            &me.to_string(),
            &member_strs,
        )?;

        db.get_chat(&chat_id)?
            .map(records::chat)
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("chat {} missing after insert", chat_id)))
    })
    .await??;

    info!(
        "{} created {} chat {} with {} members",
        identity.username,
        if is_group { "group" } else { "direct" },
        chat.id,
        member_ids.len()
    );
    Ok((StatusCode::CREATED, Json(ChatWithMembers { chat, member_ids })))
}

pub async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<ChatDetail>> {
    let db = state.db.clone();
    let me = identity.user_id;

    let detail = tokio::task::spawn_blocking(move || -> ApiResult<ChatDetail> {
        authorize_member(&db, chat_id, me)?;
        let cid = chat_id.to_string();
        let chat = db
            .get_chat(&cid)?
            .map(records::chat)
            .ok_or_else(|| ApiError::not_found("chat not found"))?;
        let members = db.get_members(&cid)?.into_iter().map(records::member).collect();
        Ok(ChatDetail { chat, members })
    })
    .await??;

    Ok(Json(detail))
}

/// Leave a group chat. The last member out takes the chat with them; if the
/// last admin leaves, the longest-standing member is promoted.
pub async fn leave_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<LeaveResponse>> {
    let db = state.db.clone();
    let me = identity.user_id;

    let response = tokio::task::spawn_blocking(move || -> ApiResult<LeaveResponse> {
        let cid = chat_id.to_string();
        let chat = db
            .get_chat(&cid)?
            .ok_or_else(|| ApiError::not_found("chat not found"))?;
        if !chat.is_group {
            return Err(ApiError::validation("direct chats cannot be left"));
        }

        match db.leave_chat(&cid, &me.to_string())? {
            LeaveOutcome::NotMember => Err(ApiError::forbidden("not a member of this chat")),
            LeaveOutcome::ChatDeleted => Ok(LeaveResponse {
                chat_id,
                chat_deleted: true,
                promoted: None,
            }),
            LeaveOutcome::Left { promoted } => {
                let promoted = match promoted {
                    Some(heir) => db
                        .get_members(&cid)?
                        .into_iter()
                        .find(|m| m.user_id == heir)
                        .map(records::member),
                    None => None,
                };
                Ok(LeaveResponse {
                    chat_id,
                    chat_deleted: false,
                    promoted,
                })
            }
        }
    })
    .await??;

    info!("{} left chat {} (deleted: {})", me, chat_id, response.chat_deleted);
    Ok(Json(response))
}
