use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use huddle_types::events::{CLOSE_CREDENTIAL_EXPIRED, ErrorCode, GatewayCommand, GatewayEvent, Room};

use crate::credentials::Identity;
use crate::dispatcher::{ConnectionId, Dispatcher};
use crate::policy::JoinPolicy;
use crate::routing::{Route, route};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// One authenticated relay connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub identity: Identity,
}

/// Drive a WebSocket whose credential was already verified at the HTTP
/// upgrade. Registration puts the connection in its personal room before
/// `Ready` goes out.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, identity: Identity, policy: JoinPolicy) {
    let (mut sender, mut receiver) = socket.split();
    let (connection_id, mut rx) = dispatcher.register(identity.user_id).await;
    let session = Session {
        connection_id,
        identity,
    };

    info!(
        "{} ({}) connected to relay as {}",
        session.identity.username, session.identity.user_id, connection_id
    );

    let ready = GatewayEvent::Ready {
        user_id: session.identity.user_id,
        username: session.identity.username.clone(),
        connection_id,
    };
    if send_event(&mut sender, &ready).await.is_err() {
        dispatcher.unregister(connection_id).await;
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let remaining = (session.identity.expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);

    // Forward routed events -> client, with heartbeat and credential expiry
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        let expiry = tokio::time::sleep(remaining);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                _ = &mut expiry => {
                    info!("Credential expired, closing relay connection");
                    let frame = CloseFrame {
                        code: CLOSE_CREDENTIAL_EXPIRED,
                        reason: Utf8Bytes::from_static("credential expired"),
                    };
                    let _ = sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let session_recv = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&dispatcher_recv, &session_recv, &policy, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            session_recv.identity.username,
                            session_recv.identity.user_id,
                            e,
                            truncate(&text, 200)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister(connection_id).await;
    info!(
        "{} ({}) disconnected from relay",
        session.identity.username, session.identity.user_id
    );
}

/// Apply one command on behalf of `session`. Commands from one connection
/// are handled in arrival order, so its events reach each room in order.
pub async fn handle_command(dispatcher: &Dispatcher, session: &Session, policy: &JoinPolicy, cmd: GatewayCommand) {
    let conn_id = session.connection_id;
    let user_id = session.identity.user_id;

    match route(cmd, &session.identity) {
        Route::Join(chat_id) => match policy.admits(chat_id, user_id).await {
            Ok(true) => {
                dispatcher.join(conn_id, Room::Chat(chat_id)).await;
                debug!("{} joined chat:{}", conn_id, chat_id);
            }
            Ok(false) => {
                warn!("{} refused chat:{} (not a member)", user_id, chat_id);
                let refusal = GatewayEvent::Error {
                    code: ErrorCode::Forbidden,
                    message: format!("not a member of chat {}", chat_id),
                };
                dispatcher.send_to(conn_id, refusal).await;
            }
            Err(e) => {
                error!("Membership check failed for chat:{}: {}", chat_id, e);
            }
        },

        Route::Leave(chat_id) => {
            dispatcher.leave(conn_id, Room::Chat(chat_id)).await;
            debug!("{} left chat:{}", conn_id, chat_id);
        }

        Route::Publish {
            rooms,
            event,
            include_sender,
        } => {
            let exclude = (!include_sender).then_some(conn_id);
            let delivered = dispatcher.publish_to(&rooms, event, exclude).await;
            debug!("{} relayed to {} connection(s)", conn_id, delivered);
        }
    }
}

async fn send_event<S>(sender: &mut S, event: &GatewayEvent) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize relay event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
