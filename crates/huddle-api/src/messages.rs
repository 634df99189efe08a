use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use futures_util::future::try_join_all;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_db::models::{NewAttachment, NewMessage};
use huddle_db::{Database, timestamp};
use huddle_gateway::credentials::Identity;
use huddle_types::api::{CreateMessageRequest, EditMessageRequest, HistoryPage, HistoryQuery, MarkReadRequest};
use huddle_types::models::{DeletedMessage, MessageRecord, ReadReceipt};

use crate::error::{ApiError, ApiResult};
use crate::lifecycle::{self, EditCandidate};
use crate::records;
use crate::state::AppState;

/// The chat must exist and the caller must belong to it.
pub(crate) fn authorize_member(db: &Database, chat_id: Uuid, user_id: Uuid) -> ApiResult<()> {
    let cid = chat_id.to_string();
    if db.get_chat(&cid)?.is_none() {
        return Err(ApiError::not_found("chat not found"));
    }
    if !db.is_member(&cid, &user_id.to_string())? {
        return Err(ApiError::forbidden("not a member of this chat"));
    }
    Ok(())
}

fn message_in_chat(db: &Database, chat_id: Uuid, message_id: Uuid) -> ApiResult<MessageRecord> {
    records::load_message(db, &message_id.to_string())?
        .filter(|m| m.chat_id == chat_id)
        .ok_or_else(|| ApiError::not_found("message not found"))
}

/// A page of history, oldest first. With `mark_read` the newest message of
/// the page receives a receipt from the caller.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<HistoryPage>> {
    let db = state.db.clone();
    let me = identity.user_id;
    let limit = query.limit();

    let page = tokio::task::spawn_blocking(move || -> ApiResult<HistoryPage> {
        authorize_member(&db, chat_id, me)?;

        let cursor = query.cursor.map(|c| c.to_string());
        let page = db
            .get_messages_page(&chat_id.to_string(), limit, cursor.as_deref())?
            .ok_or_else(|| ApiError::not_found("cursor message not found in this chat"))?;
        let has_more = page.has_more;
        let mut messages = records::hydrate(&db, page.rows)?;

        let next_cursor = if has_more { messages.first().map(|m| m.id) } else { None };

        let mut marked_read = None;
        let mut latest_read_by = Vec::new();
        if let Some(latest) = messages.last_mut() {
            let latest_id = latest.id.to_string();
            if query.mark_read {
                let now = Utc::now();
                db.upsert_read(&latest_id, &me.to_string(), &timestamp(now))?;
                latest.reads.retain(|r| r.user_id != me);
                latest.reads.push(ReadReceipt {
                    message_id: latest.id,
                    user_id: me,
                    read_at: now,
                });
                marked_read = Some(latest.id);
            }

            let author = latest.sender_id;
            latest_read_by = db
                .get_readers(&latest_id)?
                .into_iter()
                .map(records::reader)
                .filter(|reader| reader.id != author)
                .collect();
        }

        Ok(HistoryPage {
            messages,
            next_cursor,
            latest_read_by,
            marked_read,
        })
    })
    .await??;

    Ok(Json(page))
}

/// Persist a new message. Attachments are verified first; one bad
/// attachment rejects the whole message.
pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateMessageRequest>,
) -> ApiResult<(StatusCode, Json<MessageRecord>)> {
    let content = lifecycle::creation_content(req.content.as_deref(), req.attachments.len())?;
    let me = identity.user_id;

    let db = state.db.clone();
    tokio::task::spawn_blocking(move || authorize_member(&db, chat_id, me)).await??;

    let verified = try_join_all(
        req.attachments
            .iter()
            .map(|upload| state.media.verify(chat_id, &upload.public_id)),
    )
    .await
    .map_err(|e| {
        warn!("{} sent a rejected attachment to chat {}: {}", me, chat_id, e);
        e
    })?;

    let db = state.db.clone();
    let message_id = Uuid::new_v4();
    let mut record = tokio::task::spawn_blocking(move || -> ApiResult<MessageRecord> {
        let id = message_id.to_string();
        let cid = chat_id.to_string();
        let sid = me.to_string();
        let created_at = timestamp(Utc::now());
        let attachments: Vec<NewAttachment> = verified
            .into_iter()
            .map(|media| NewAttachment {
                id: Uuid::new_v4().to_string(),
                url: media.url,
                kind: media.kind.as_str().to_string(),
            })
            .collect();

        db.insert_message(
            &NewMessage {
                id: &id,
                chat_id: &cid,
                sender_id: &sid,
                content: &content,
                created_at: &created_at,
            },
            &attachments,
        )?;

        records::load_message(&db, &id)?
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("message {} missing after insert", id)))
    })
    .await??;

    record.client_ref = req.client_ref;
    info!("{} ({}) posted {} to chat {}", identity.username, me, record.id, chat_id);
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<Json<MessageRecord>> {
    let content = lifecycle::edited_content(&req.content)?;
    let db = state.db.clone();
    let me = identity.user_id;

    let record = tokio::task::spawn_blocking(move || -> ApiResult<MessageRecord> {
        authorize_member(&db, chat_id, me)?;
        let current = message_in_chat(&db, chat_id, message_id)?;
        let candidate = EditCandidate {
            sender_id: current.sender_id,
            created_at: current.created_at,
            attachment_count: current.attachments.len(),
        };
        lifecycle::check_edit(&candidate, me, Utc::now())?;

        // A concurrent delete may have won since the lookup
        if !db.update_message_content(&message_id.to_string(), &content)? {
            return Err(ApiError::not_found("message not found"));
        }
        message_in_chat(&db, chat_id, message_id)
    })
    .await??;

    Ok(Json(record))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<DeletedMessage>> {
    let db = state.db.clone();
    let me = identity.user_id;

    tokio::task::spawn_blocking(move || -> ApiResult<()> {
        authorize_member(&db, chat_id, me)?;
        let mid = message_id.to_string();
        let row = db
            .get_message(&mid)?
            .filter(|row| row.chat_id == chat_id.to_string())
            .ok_or_else(|| ApiError::not_found("message not found"))?;
        lifecycle::check_delete(row.sender_id.parse().unwrap_or_default(), me)?;

        if !db.delete_message(&mid)? {
            return Err(ApiError::not_found("message not found"));
        }
        Ok(())
    })
    .await??;

    info!("{} deleted {} in chat {}", me, message_id, chat_id);
    Ok(Json(DeletedMessage {
        id: message_id,
        chat_id,
    }))
}

/// Upsert a receipt for one message; used by the live-read path.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<Json<ReadReceipt>> {
    let db = state.db.clone();
    let me = identity.user_id;

    let receipt = tokio::task::spawn_blocking(move || -> ApiResult<ReadReceipt> {
        authorize_member(&db, chat_id, me)?;
        message_in_chat(&db, chat_id, req.message_id)?;
        let now = Utc::now();
        db.upsert_read(&req.message_id.to_string(), &me.to_string(), &timestamp(now))?;
        Ok(ReadReceipt {
            message_id: req.message_id,
            user_id: me,
            read_at: now,
        })
    })
    .await??;

    Ok(Json(receipt))
}
