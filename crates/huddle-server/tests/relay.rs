use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{StatusCode, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use huddle_api::media::NoMedia;
use huddle_api::state::AppStateInner;
use huddle_client::api::ApiClient;
use huddle_client::credentials::{Refresher, TokenStore};
use huddle_client::session::{Disconnect, Session};
use huddle_client::ClientError;
use huddle_db::Database;
use huddle_gateway::credentials::{CredentialVerifier, JwtVerifier};
use huddle_gateway::dispatcher::Dispatcher;
use huddle_gateway::policy::JoinPolicy;
use huddle_server::{ServerState, build_router};
use huddle_types::api::{CreateChatRequest, CreateMessageRequest};
use huddle_types::events::{CLOSE_CREDENTIAL_EXPIRED, GatewayCommand, GatewayEvent};
use huddle_types::models::{MessageRecord, UserSummary};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: StdDuration = StdDuration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    db: Arc<Database>,
    verifier: Arc<JwtVerifier>,
}

impl TestServer {
    async fn start() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let verifier = Arc::new(JwtVerifier::new("relay-test-secret"));
        let shared: Arc<dyn CredentialVerifier> = verifier.clone();
        let state = ServerState {
            app: Arc::new(AppStateInner {
                db: db.clone(),
                verifier: shared.clone(),
                media: Arc::new(NoMedia),
            }),
            dispatcher: Dispatcher::new(),
            verifier: shared,
            policy: JoinPolicy::Open,
        };
        let app = build_router(state, None).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, db, verifier }
    }

    fn user(&self, name: &str) -> (UserSummary, String) {
        let id = Uuid::new_v4();
        self.db.create_user(&id.to_string(), name, None).unwrap();
        let token = self.verifier.issue(id, name, Duration::minutes(15)).unwrap();
        let summary = UserSummary {
            id,
            username: name.to_string(),
            image: None,
        };
        (summary, token)
    }

    fn relay_url(&self) -> String {
        format!("ws://{}/gateway", self.addr)
    }

    async fn connect(&self, token: &str) -> Ws {
        let mut request = self.relay_url().into_client_request().unwrap();
        request
            .headers_mut()
            .insert(AUTHORIZATION, format!("Bearer {}", token).parse().unwrap());
        let (ws, _) = connect_async(request).await.unwrap();
        ws
    }

    fn api(&self, token: Option<String>, refresher: Arc<dyn Refresher>) -> ApiClient {
        let tokens = Arc::new(TokenStore::new(token, refresher));
        ApiClient::new(reqwest::Client::new(), format!("http://{}", self.addr), tokens)
    }
}

async fn next_event(ws: &mut Ws) -> GatewayEvent {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("relay closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(ws: &mut Ws, cmd: &GatewayCommand) {
    let text = serde_json::to_string(cmd).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Join, then wait for our own read echo so the join is known to be in place.
async fn join(ws: &mut Ws, chat_id: Uuid) {
    let marker = Uuid::new_v4();
    send(ws, &GatewayCommand::Join { chat_id }).await;
    send(ws, &GatewayCommand::MessageRead { message_id: marker, chat_id }).await;
    loop {
        if let GatewayEvent::MessageReadBy { message_id, .. } = next_event(ws).await {
            if message_id == marker {
                return;
            }
        }
    }
}

fn record(chat_id: Uuid, sender: &UserSummary, content: &str) -> MessageRecord {
    MessageRecord {
        id: Uuid::new_v4(),
        chat_id,
        sender_id: sender.id,
        sender: sender.clone(),
        content: content.to_string(),
        created_at: Utc::now(),
        edited: false,
        attachments: vec![],
        reads: vec![],
        client_ref: None,
    }
}

#[tokio::test]
async fn handshake_sends_ready() {
    let server = TestServer::start().await;
    let (ada, token) = server.user("ada");

    let mut ws = server.connect(&token).await;
    match next_event(&mut ws).await {
        GatewayEvent::Ready { user_id, username, .. } => {
            assert_eq!(user_id, ada.id);
            assert_eq!(username, "ada");
        }
        other => panic!("expected ready, got {:?}", other),
    }

    // Browsers cannot set headers on a WebSocket, so the query works too
    let url = format!("{}?token={}", server.relay_url(), token);
    let (mut ws, _) = connect_async(url).await.unwrap();
    assert!(matches!(next_event(&mut ws).await, GatewayEvent::Ready { .. }));
}

#[tokio::test]
async fn bad_credential_is_refused_before_upgrade() {
    let server = TestServer::start().await;

    let mut request = server.relay_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, "Bearer not-a-token".parse().unwrap());
    match connect_async(request).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), StatusCode::UNAUTHORIZED),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("handshake should fail"),
    }

    match connect_async(server.relay_url()).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), StatusCode::UNAUTHORIZED),
        _ => panic!("missing credential should fail"),
    }
}

#[tokio::test]
async fn relayed_message_reaches_peers_but_not_sender() {
    let server = TestServer::start().await;
    let (ada, ada_token) = server.user("ada");
    let (_bob, bob_token) = server.user("bob");
    let chat_id = Uuid::new_v4();

    let mut ada_ws = server.connect(&ada_token).await;
    let mut bob_ws = server.connect(&bob_token).await;
    next_event(&mut ada_ws).await;
    next_event(&mut bob_ws).await;
    join(&mut ada_ws, chat_id).await;
    join(&mut bob_ws, chat_id).await;

    let msg = record(chat_id, &ada, "hello bob");
    send(&mut ada_ws, &GatewayCommand::MessageSent(msg.clone())).await;

    loop {
        match next_event(&mut bob_ws).await {
            GatewayEvent::NewMessage(relayed) => {
                assert_eq!(relayed, msg);
                break;
            }
            GatewayEvent::MessageReadBy { .. } => continue,
            other => panic!("unexpected {:?}", other),
        }
    }

    // Anything relayed to ada would be queued ahead of this echo
    let marker = Uuid::new_v4();
    send(&mut ada_ws, &GatewayCommand::MessageRead { message_id: marker, chat_id }).await;
    loop {
        match next_event(&mut ada_ws).await {
            GatewayEvent::MessageReadBy { message_id, reader_id, .. } if message_id == marker => {
                assert_eq!(reader_id, ada.id);
                break;
            }
            GatewayEvent::MessageReadBy { .. } => continue,
            other => panic!("sender received {:?}", other),
        }
    }
}

#[tokio::test]
async fn expired_credential_closes_with_4001() {
    let server = TestServer::start().await;
    let id = Uuid::new_v4();
    let token = server.verifier.issue(id, "ada", Duration::seconds(2)).unwrap();

    let mut ws = server.connect(&token).await;
    assert!(matches!(next_event(&mut ws).await, GatewayEvent::Ready { .. }));

    let code = loop {
        let frame = timeout(WAIT, ws.next()).await.expect("no close frame");
        match frame {
            Some(Ok(Message::Close(Some(frame)))) => break u16::from(frame.code),
            Some(Ok(_)) => continue,
            other => panic!("unexpected {:?}", other),
        }
    };
    assert_eq!(code, CLOSE_CREDENTIAL_EXPIRED);
}

/// Hands out a freshly signed credential for one user.
struct Reissue {
    verifier: Arc<JwtVerifier>,
    user: UserSummary,
    calls: Arc<AtomicUsize>,
}

impl Refresher for Reissue {
    fn refresh(&self) -> BoxFuture<'static, Result<String, ClientError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let token = self
            .verifier
            .issue(self.user.id, &self.user.username, Duration::minutes(15))
            .map_err(|e| ClientError::Refresh(e.to_string()));
        futures_util::future::ready(token).boxed()
    }
}

async fn wait_for(
    rx: &mut broadcast::Receiver<GatewayEvent>,
    mut matches: impl FnMut(&GatewayEvent) -> bool,
) -> GatewayEvent {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("session closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Join is sent before `open_chat` returns; wait for our own echo on the
/// same socket to know the relay has applied it.
async fn settle(session: &Session, chat_id: Uuid) {
    let mut events = session.subscribe();
    let marker = Uuid::new_v4();
    session
        .send_command(GatewayCommand::MessageRead { message_id: marker, chat_id })
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::MessageReadBy { message_id, .. } if *message_id == marker)
    })
    .await;
}

#[tokio::test]
async fn sessions_sync_messages_and_receipts() {
    let server = TestServer::start().await;
    let (ada, ada_token) = server.user("ada");
    let (bob, bob_token) = server.user("bob");

    let refresher = |user: &UserSummary| -> Arc<dyn Refresher> {
        Arc::new(Reissue {
            verifier: server.verifier.clone(),
            user: user.clone(),
            calls: Arc::new(AtomicUsize::new(0)),
        })
    };
    let ada_api = server.api(Some(ada_token), refresher(&ada));
    let bob_api = server.api(Some(bob_token), refresher(&bob));

    let created = ada_api
        .create_chat(&CreateChatRequest {
            member_ids: vec![bob.id],
            name: None,
            image: None,
        })
        .await
        .unwrap();
    let chat_id = created.chat.id;

    let ada_session = Session::connect(server.relay_url(), ada_api, ada.clone()).await.unwrap();
    let bob_session = Session::connect(server.relay_url(), bob_api, bob.clone()).await.unwrap();
    ada_session.open_chat(chat_id).await.unwrap();
    bob_session.open_chat(chat_id).await.unwrap();
    settle(&ada_session, chat_id).await;
    settle(&bob_session, chat_id).await;

    let mut ada_events = ada_session.subscribe();
    let mut bob_events = bob_session.subscribe();

    let sent = bob_session.send_message(chat_id, "hi ada").await.unwrap();
    {
        let state = bob_session.state();
        let state = state.lock().await;
        let timeline = state.timeline(chat_id).unwrap();
        assert_eq!(timeline.len(), 1);
        assert!(timeline.get(sent.id).unwrap().is_confirmed());
    }

    wait_for(&mut ada_events, |e| matches!(e, GatewayEvent::NewMessage(m) if m.id == sent.id)).await;
    {
        let state = ada_session.state();
        let state = state.lock().await;
        let contents: Vec<_> = state
            .timeline(chat_id)
            .unwrap()
            .messages()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["hi ada"]);
    }

    // Ada has the chat open, so her session marks the message read on its own
    wait_for(&mut bob_events, |e| {
        matches!(e, GatewayEvent::MessageReadBy { message_id, reader_id, .. }
            if *message_id == sent.id && *reader_id == ada.id)
    })
    .await;
    let readers = bob_session.state().lock().await.timeline(chat_id).unwrap().read_by(sent.id);
    assert_eq!(readers, vec![ada.clone()]);
}

#[tokio::test]
async fn rejected_handshake_is_retried_with_a_fresh_credential() {
    let server = TestServer::start().await;
    let (ada, _) = server.user("ada");
    let calls = Arc::new(AtomicUsize::new(0));
    let api = server.api(
        Some("expired-or-garbage".into()),
        Arc::new(Reissue {
            verifier: server.verifier.clone(),
            user: ada.clone(),
            calls: calls.clone(),
        }),
    );

    let session = Session::connect(server.relay_url(), api, ada.clone()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = session.state();
    timeout(WAIT, async {
        while state.lock().await.connection_id().is_none() {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await
    .expect("never became ready");
}

fn refresher(server: &TestServer, user: &UserSummary) -> Arc<dyn Refresher> {
    Arc::new(Reissue {
        verifier: server.verifier.clone(),
        user: user.clone(),
        calls: Arc::new(AtomicUsize::new(0)),
    })
}

async fn create_chat(api: &ApiClient, with: &UserSummary) -> Uuid {
    api.create_chat(&CreateChatRequest {
        member_ids: vec![with.id],
        name: None,
        image: None,
    })
    .await
    .unwrap()
    .chat
    .id
}

/// Persist without relaying, as if the live event never reached us.
async fn post_quietly(api: &ApiClient, chat_id: Uuid, content: &str) {
    api.send_message(
        chat_id,
        &CreateMessageRequest {
            content: Some(content.to_string()),
            attachments: vec![],
            client_ref: None,
        },
    )
    .await
    .unwrap();
}

async fn contents(session: &Session, chat_id: Uuid) -> Vec<String> {
    let state = session.state();
    let state = state.lock().await;
    state
        .timeline(chat_id)
        .map(|t| t.messages().map(|m| m.content.clone()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn reopened_chat_backfills_messages_missed_while_away() {
    let server = TestServer::start().await;
    let (ada, ada_token) = server.user("ada");
    let (bob, bob_token) = server.user("bob");
    let (cy, _) = server.user("cy");
    let ada_api = server.api(Some(ada_token), refresher(&server, &ada));
    let bob_api = server.api(Some(bob_token), refresher(&server, &bob));

    let chat_id = create_chat(&bob_api, &ada).await;
    let elsewhere = create_chat(&ada_api, &cy).await;
    for i in 0..4 {
        post_quietly(&bob_api, chat_id, &format!("m{}", i)).await;
    }

    let mut ada_session = Session::connect(server.relay_url(), ada_api, ada.clone()).await.unwrap();
    ada_session.set_page_size(2);
    ada_session.open_chat(chat_id).await.unwrap();
    assert_eq!(contents(&ada_session, chat_id).await, vec!["m2", "m3"]);

    ada_session.open_chat(elsewhere).await.unwrap();
    for i in 4..9 {
        post_quietly(&bob_api, chat_id, &format!("m{}", i)).await;
    }
    ada_session.open_chat(chat_id).await.unwrap();
    assert_eq!(contents(&ada_session, chat_id).await, vec!["m2", "m3", "m7", "m8"]);

    while ada_session.load_older(chat_id).await.unwrap() {}

    let expected: Vec<String> = (0..9).map(|i| format!("m{}", i)).collect();
    assert_eq!(contents(&ada_session, chat_id).await, expected);
}

#[tokio::test]
async fn reconnect_after_expiry_catches_up() {
    let server = TestServer::start().await;
    let (ada, _) = server.user("ada");
    let (bob, bob_token) = server.user("bob");
    let short_lived = server.verifier.issue(ada.id, "ada", Duration::seconds(2)).unwrap();
    let ada_api = server.api(Some(short_lived), refresher(&server, &ada));
    let bob_api = server.api(Some(bob_token), refresher(&server, &bob));
    let chat_id = create_chat(&bob_api, &ada).await;

    let mut ada_session = Session::connect(server.relay_url(), ada_api, ada.clone()).await.unwrap();
    ada_session.open_chat(chat_id).await.unwrap();

    let reason = timeout(WAIT, ada_session.closed()).await.expect("socket stayed open");
    assert_eq!(reason, Disconnect::CredentialExpired);

    // Saved on the server even though peers cannot be told live
    let sent = ada_session.send_message(chat_id, "saved anyway").await.unwrap();
    let edited = ada_session.edit_message(chat_id, sent.id, "saved anyway!").await.unwrap();
    assert!(edited.edited);
    post_quietly(&bob_api, chat_id, "while you were away").await;

    ada_session.reconnect().await.unwrap();
    assert_eq!(
        contents(&ada_session, chat_id).await,
        vec!["saved anyway!", "while you were away"]
    );
    {
        let state = ada_session.state();
        let state = state.lock().await;
        assert!(state.timeline(chat_id).unwrap().entries().all(|e| e.is_confirmed()));
    }

    settle(&ada_session, chat_id).await;
}
