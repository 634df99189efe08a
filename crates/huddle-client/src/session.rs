//! One relay connection per signed-in client.
//!
//! The socket is subscribed exactly once; switching the active chat only
//! sends `leave`/`join`. Every event lands in a [`SyncState`] behind a
//! single `Arc` that survives reconnects, so views read one consistent copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_types::api::{CreateMessageRequest, DEFAULT_PAGE_LIMIT, HistoryQuery};
use huddle_types::events::{CLOSE_CREDENTIAL_EXPIRED, GatewayCommand, GatewayEvent};
use huddle_types::models::{ChatMember, MessageRecord, UserSummary};

use crate::api::ApiClient;
use crate::credentials::TokenStore;
use crate::error::ClientError;
use crate::receipts::{READ_DEBOUNCE, debounce_latest};
use crate::timeline::Timeline;
use crate::typing::{TypingEmitter, TypingRoster, TypingSignal};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 256;

/// Why the relay connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Closed with 4001; refresh before reconnecting.
    CredentialExpired,
    Closed(Option<u16>),
    Failed(String),
}

/// Everything the relay has told this client so far.
pub struct SyncState {
    me: UserSummary,
    connection_id: Option<Uuid>,
    active: Option<Uuid>,
    timelines: HashMap<Uuid, Timeline>,
    members: HashMap<Uuid, Vec<ChatMember>>,
    typing: TypingRoster,
}

pub type SharedState = Arc<Mutex<SyncState>>;

impl SyncState {
    pub fn new(me: UserSummary) -> Self {
        Self {
            me,
            connection_id: None,
            active: None,
            timelines: HashMap::new(),
            members: HashMap::new(),
            typing: TypingRoster::new(),
        }
    }

    pub fn me(&self) -> &UserSummary {
        &self.me
    }

    /// Set once the relay has sent `ready`.
    pub fn connection_id(&self) -> Option<Uuid> {
        self.connection_id
    }

    pub fn active_chat(&self) -> Option<Uuid> {
        self.active
    }

    pub fn timeline(&self, chat_id: Uuid) -> Option<&Timeline> {
        self.timelines.get(&chat_id)
    }

    pub fn members(&self, chat_id: Uuid) -> &[ChatMember] {
        self.members.get(&chat_id).map_or(&[], Vec::as_slice)
    }

    pub fn typing(&self) -> &TypingRoster {
        &self.typing
    }

    fn timeline_mut(&mut self, chat_id: Uuid) -> &mut Timeline {
        let me = self.me.clone();
        self.timelines
            .entry(chat_id)
            .or_insert_with(|| Timeline::new(chat_id, me))
    }

    fn my_membership(&self, chat_id: Uuid) -> Option<ChatMember> {
        self.members
            .get(&chat_id)?
            .iter()
            .find(|m| m.user.id == self.me.id)
            .cloned()
    }

    /// Returns `(chat_id, message_id)` when the event is a new message from
    /// someone else in the chat on screen, i.e. one that should be marked read.
    pub fn apply(&mut self, event: &GatewayEvent) -> Option<(Uuid, Uuid)> {
        if let GatewayEvent::Ready { connection_id, .. } = event {
            self.connection_id = Some(*connection_id);
        }
        self.typing.apply(event);

        let chat_id = event.chat_id()?;
        match event {
            GatewayEvent::AddedMembers { members, .. } => {
                let list = self.members.entry(chat_id).or_default();
                for member in members {
                    match list.iter_mut().find(|m| m.user.id == member.user.id) {
                        Some(known) => *known = member.clone(),
                        None => list.push(member.clone()),
                    }
                }
            }
            GatewayEvent::LeftMember { member, .. } | GatewayEvent::DeletedMember { member, .. } => {
                if let Some(list) = self.members.get_mut(&chat_id) {
                    list.retain(|m| m.user.id != member.user.id);
                }
            }
            _ => {}
        }

        let changed = self.timelines.get_mut(&chat_id)?.apply_event(event);
        match event {
            GatewayEvent::NewMessage(message)
                if changed && self.active == Some(chat_id) && message.sender_id != self.me.id =>
            {
                Some((chat_id, message.id))
            }
            _ => None,
        }
    }
}

/// Command sender that stays valid across reconnects.
#[derive(Clone)]
struct Outbox {
    tx: Arc<StdMutex<mpsc::UnboundedSender<GatewayCommand>>>,
}

impl Outbox {
    fn new(tx: mpsc::UnboundedSender<GatewayCommand>) -> Self {
        Self {
            tx: Arc::new(StdMutex::new(tx)),
        }
    }

    fn replace(&self, tx: mpsc::UnboundedSender<GatewayCommand>) {
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    fn send(&self, cmd: GatewayCommand) -> Result<(), ClientError> {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(cmd)
            .map_err(|_| ClientError::Closed)
    }

    /// Fan-out after a change the server already saved. A closed socket only
    /// costs peers the live update; they see it on their next fetch.
    fn relay(&self, cmd: GatewayCommand) -> bool {
        let sent = self.tx.lock().unwrap_or_else(|e| e.into_inner()).send(cmd);
        match sent {
            Ok(()) => true,
            Err(mpsc::error::SendError(cmd)) => {
                warn!("Relay closed, peers were not notified");
                debug!("Unsent relay command: {:?}", cmd);
                false
            }
        }
    }
}

/// Reader and writer tasks of one socket. Dropping it tears both down.
struct Link {
    closed: watch::Receiver<Option<Disconnect>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub struct Session {
    relay_url: String,
    api: ApiClient,
    state: SharedState,
    events: broadcast::Sender<GatewayEvent>,
    outbox: Outbox,
    reads: mpsc::UnboundedSender<(Uuid, Uuid)>,
    read_task: JoinHandle<()>,
    display_name: String,
    typing: Arc<StdMutex<TypingEmitter>>,
    page_size: u32,
    link: Link,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

impl Session {
    /// Open the relay socket. A rejected handshake is retried once with a
    /// refreshed credential.
    pub async fn connect(relay_url: impl Into<String>, api: ApiClient, me: UserSummary) -> Result<Self, ClientError> {
        let relay_url = relay_url.into();
        let display_name = me.username.clone();
        let state: SharedState = Arc::new(Mutex::new(SyncState::new(me)));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (reads, reads_rx) = mpsc::unbounded_channel();

        let ws = dial_with_refresh(&relay_url, api.tokens()).await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(cmd_tx);
        let link = spawn_link(ws, cmd_rx, state.clone(), events.clone(), reads.clone());
        let read_task = tokio::spawn(send_read_receipts(api.clone(), outbox.clone(), reads_rx));

        info!("Relay session open at {}", relay_url);
        Ok(Self {
            relay_url,
            api,
            state,
            events,
            outbox,
            reads,
            read_task,
            display_name,
            typing: Arc::new(StdMutex::new(TypingEmitter::default())),
            page_size: DEFAULT_PAGE_LIMIT,
            link,
        })
    }

    /// Messages per history fetch.
    pub fn set_page_size(&mut self, page_size: u32) {
        self.page_size = page_size.max(1);
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn send_command(&self, cmd: GatewayCommand) -> Result<(), ClientError> {
        self.outbox.send(cmd)
    }

    /// Wait until the current socket ends.
    pub async fn closed(&mut self) -> Disconnect {
        match self.link.closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(Disconnect::Closed(None)),
            Err(_) => Disconnect::Closed(None),
        }
    }

    /// Replace the socket, keeping all synchronized state, then rejoin the
    /// active chat and fetch what was missed while disconnected.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        let expired = matches!(&*self.link.closed.borrow(), Some(Disconnect::CredentialExpired));
        if expired {
            self.api.tokens().refresh().await?;
        }

        let ws = dial_with_refresh(&self.relay_url, self.api.tokens()).await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.outbox.replace(cmd_tx);
        self.link = spawn_link(
            ws,
            cmd_rx,
            self.state.clone(),
            self.events.clone(),
            self.reads.clone(),
        );

        let active = self.state.lock().await.active;
        if let Some(chat_id) = active {
            self.outbox.send(GatewayCommand::Join { chat_id })?;
            self.load_latest(chat_id).await?;
        }
        info!("Relay session reconnected");
        Ok(())
    }

    /// Make `chat_id` the chat on screen: move the room subscription, then
    /// load its members and newest page, marking it read.
    pub async fn open_chat(&self, chat_id: Uuid) -> Result<(), ClientError> {
        let previous = {
            let mut state = self.state.lock().await;
            if state.active == Some(chat_id) {
                return Ok(());
            }
            state.timeline_mut(chat_id);
            state.active.replace(chat_id)
        };
        if let Some(previous) = previous {
            self.stop_typing(previous);
            self.outbox.send(GatewayCommand::Leave { chat_id: previous })?;
        }
        self.outbox.send(GatewayCommand::Join { chat_id })?;
        self.load_latest(chat_id).await
    }

    /// Members and newest page of a chat, marking it read. Anything newer
    /// than what the timeline held is merged, and a gap left behind is
    /// filled by `load_older`.
    async fn load_latest(&self, chat_id: Uuid) -> Result<(), ClientError> {
        let detail = self.api.get_chat(chat_id).await?;
        let query = HistoryQuery {
            limit: Some(self.page_size.to_string()),
            mark_read: true,
            ..Default::default()
        };
        let page = self.api.history(chat_id, &query).await?;
        let marked = page.marked_read;

        {
            let mut state = self.state.lock().await;
            let timeline = state.timeline_mut(chat_id);
            timeline.set_members(&detail.members);
            timeline.apply_latest_page(page);
            state.members.insert(chat_id, detail.members);
        }

        if let Some(message_id) = marked {
            self.outbox.relay(GatewayCommand::MessageRead { message_id, chat_id });
        }
        Ok(())
    }

    /// Fetch the next older page. Returns false when history is exhausted
    /// or the response went stale while in flight.
    pub async fn load_older(&self, chat_id: Uuid) -> Result<bool, ClientError> {
        let cursor = {
            let state = self.state.lock().await;
            match state.timeline(chat_id).and_then(Timeline::cursor) {
                Some(cursor) => cursor,
                None => return Ok(false),
            }
        };
        let query = HistoryQuery {
            cursor: Some(cursor),
            limit: Some(self.page_size.to_string()),
            ..Default::default()
        };
        let page = self.api.history(chat_id, &query).await?;
        Ok(self.state.lock().await.timeline_mut(chat_id).apply_older_page(cursor, page))
    }

    /// Optimistic send: the entry shows up at once, is replaced by the
    /// server's record on success and marked failed otherwise.
    pub async fn send_message(&self, chat_id: Uuid, content: &str) -> Result<MessageRecord, ClientError> {
        let client_ref = Uuid::new_v4().to_string();
        self.state
            .lock()
            .await
            .timeline_mut(chat_id)
            .begin_send(&client_ref, content, Utc::now());
        self.stop_typing(chat_id);

        let req = CreateMessageRequest {
            content: Some(content.to_string()),
            attachments: Vec::new(),
            client_ref: Some(client_ref.clone()),
        };
        match self.api.send_message(chat_id, &req).await {
            Ok(record) => {
                self.state
                    .lock()
                    .await
                    .timeline_mut(chat_id)
                    .confirm_send(record.clone(), Utc::now());
                self.outbox.relay(GatewayCommand::MessageSent(record.clone()));
                Ok(record)
            }
            Err(e) => {
                warn!("Send to chat {} failed: {}", chat_id, e);
                self.state
                    .lock()
                    .await
                    .timeline_mut(chat_id)
                    .fail_send(&client_ref, &e.to_string());
                Err(e)
            }
        }
    }

    pub async fn edit_message(&self, chat_id: Uuid, message_id: Uuid, content: &str) -> Result<MessageRecord, ClientError> {
        let record = self.api.edit_message(chat_id, message_id, content).await?;
        self.state.lock().await.apply(&GatewayEvent::EditedMessage(record.clone()));
        self.outbox.relay(GatewayCommand::MessageEdit(record.clone()));
        Ok(record)
    }

    pub async fn delete_message(&self, chat_id: Uuid, message_id: Uuid) -> Result<(), ClientError> {
        let deleted = self.api.delete_message(chat_id, message_id).await?;
        self.state.lock().await.apply(&GatewayEvent::DeletedMessage(deleted));
        self.outbox.relay(GatewayCommand::MessageDelete(deleted));
        Ok(())
    }

    /// Leave a group chat and tell the remaining members, including who
    /// inherited the admin role.
    pub async fn leave_chat(&self, chat_id: Uuid) -> Result<(), ClientError> {
        let membership = self.state.lock().await.my_membership(chat_id);
        let outcome = self.api.leave_chat(chat_id).await?;

        if !outcome.chat_deleted {
            if let Some(member) = membership {
                self.outbox.relay(GatewayCommand::LeaveMember { chat_id, member });
            }
            if let Some(member) = outcome.promoted {
                self.outbox.relay(GatewayCommand::PromoteMember { chat_id, member });
            }
        }

        let mut state = self.state.lock().await;
        state.timelines.remove(&chat_id);
        state.members.remove(&chat_id);
        if state.active == Some(chat_id) {
            state.active = None;
            drop(state);
            self.outbox.relay(GatewayCommand::Leave { chat_id });
        }
        Ok(())
    }

    /// A keystroke in the composer of the active chat. Sends `typing` at the
    /// start of a burst and `stop_typing` once input goes idle.
    pub async fn typing_input(&self) -> Result<(), ClientError> {
        let Some(chat_id) = self.state.lock().await.active else {
            return Ok(());
        };
        let display_name = self.display_name.clone();

        let signal = self
            .typing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .input(Instant::now());
        if signal != Some(TypingSignal::Start) {
            return Ok(());
        }
        self.outbox.send(GatewayCommand::Typing {
            chat_id,
            display_name: display_name.clone(),
        })?;

        let typing = self.typing.clone();
        let outbox = self.outbox.clone();
        tokio::spawn(async move {
            loop {
                let deadline = typing.lock().unwrap_or_else(|e| e.into_inner()).deadline();
                let Some(deadline) = deadline else { return };
                tokio::time::sleep_until(deadline).await;

                let stop = typing
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .tick(Instant::now());
                if stop.is_some() {
                    let _ = outbox.send(GatewayCommand::StopTyping { chat_id, display_name });
                    return;
                }
            }
        });
        Ok(())
    }

    fn stop_typing(&self, chat_id: Uuid) {
        let stop = self.typing.lock().unwrap_or_else(|e| e.into_inner()).reset();
        if stop.is_some() {
            self.outbox.relay(GatewayCommand::StopTyping {
                chat_id,
                display_name: self.display_name.clone(),
            });
        }
    }
}

async fn dial(url: &str, token: Option<&str>) -> Result<WsStream, ClientError> {
    let mut request = url.into_client_request()?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| ClientError::Unauthorized)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    match connect_async(request).await {
        Ok((ws, _)) => Ok(ws),
        Err(WsError::Http(resp)) if resp.status() == StatusCode::UNAUTHORIZED => Err(ClientError::HandshakeRejected),
        Err(e) => Err(e.into()),
    }
}

async fn dial_with_refresh(url: &str, tokens: &TokenStore) -> Result<WsStream, ClientError> {
    let token = tokens.current().await;
    match dial(url, token.as_deref()).await {
        Err(ClientError::HandshakeRejected) => {
            debug!("Relay rejected credential, refreshing");
            let fresh = tokens.refresh().await?;
            dial(url, Some(&fresh)).await
        }
        other => other,
    }
}

fn spawn_link(
    ws: WsStream,
    commands: mpsc::UnboundedReceiver<GatewayCommand>,
    state: SharedState,
    events: broadcast::Sender<GatewayEvent>,
    reads: mpsc::UnboundedSender<(Uuid, Uuid)>,
) -> Link {
    let (sink, stream) = ws.split();
    let (closed_tx, closed) = watch::channel(None);
    Link {
        closed,
        reader: tokio::spawn(read_loop(stream, state, events, reads, closed_tx)),
        writer: tokio::spawn(write_loop(sink, commands)),
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    state: SharedState,
    events: broadcast::Sender<GatewayEvent>,
    reads: mpsc::UnboundedSender<(Uuid, Uuid)>,
    closed: watch::Sender<Option<Disconnect>>,
) {
    let reason = loop {
        let Some(frame) = stream.next().await else {
            break Disconnect::Closed(None);
        };
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<GatewayEvent>(&text) {
                Ok(event) => {
                    if let Some(unread) = state.lock().await.apply(&event) {
                        let _ = reads.send(unread);
                    }
                    let _ = events.send(event);
                }
                Err(e) => warn!("Undecodable relay event: {}", e),
            },
            Ok(Message::Close(frame)) => {
                let code = frame.map(|f| u16::from(f.code));
                break if code == Some(CLOSE_CREDENTIAL_EXPIRED) {
                    Disconnect::CredentialExpired
                } else {
                    Disconnect::Closed(code)
                };
            }
            Ok(_) => {}
            Err(e) => break Disconnect::Failed(e.to_string()),
        }
    };

    info!("Relay connection ended: {:?}", reason);
    let _ = closed.send(Some(reason));
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut commands: mpsc::UnboundedReceiver<GatewayCommand>) {
    while let Some(cmd) = commands.recv().await {
        let text = match serde_json::to_string(&cmd) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode relay command: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Collapse bursts of incoming messages into one receipt for the newest.
async fn send_read_receipts(api: ApiClient, outbox: Outbox, mut unread: mpsc::UnboundedReceiver<(Uuid, Uuid)>) {
    while let Some((chat_id, message_id)) = debounce_latest(&mut unread, READ_DEBOUNCE).await {
        match api.mark_read(chat_id, message_id).await {
            Ok(_) => {
                if outbox.send(GatewayCommand::MessageRead { message_id, chat_id }).is_err() {
                    debug!("Relay closed before read receipt for {}", message_id);
                }
            }
            Err(e) => warn!("Failed to mark {} read: {}", message_id, e),
        }
    }
}
