pub mod config;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use huddle_api::error::ApiError;
use huddle_api::media::{HttpMediaVerifier, MediaVerifier, NoMedia};
use huddle_api::state::{AppState, AppStateInner};
use huddle_db::Database;
use huddle_gateway::connection;
use huddle_gateway::credentials::{self, CredentialVerifier, JwtVerifier};
use huddle_gateway::dispatcher::Dispatcher;
use huddle_gateway::policy::JoinPolicy;

use crate::config::Config;

#[derive(Clone)]
pub struct ServerState {
    pub app: AppState,
    pub dispatcher: Dispatcher,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub policy: JoinPolicy,
}

impl ServerState {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let db = Arc::new(Database::open(&config.db_path)?);
        info!("Database ready at {}", config.db_path.display());

        let verifier: Arc<dyn CredentialVerifier> = Arc::new(JwtVerifier::new(&config.jwt_secret));
        let media: Arc<dyn MediaVerifier> = match &config.media_url {
            Some(url) => Arc::new(HttpMediaVerifier::new(url.as_str())),
            None => {
                warn!("HUDDLE_MEDIA_URL not set, attachments will be refused");
                Arc::new(NoMedia)
            }
        };
        let policy = if config.verify_joins {
            JoinPolicy::MembersOnly(db.clone())
        } else {
            JoinPolicy::Open
        };
        info!("Relay join policy: {:?}", policy);

        Ok(Self {
            app: Arc::new(AppStateInner {
                db,
                verifier: verifier.clone(),
                media,
            }),
            dispatcher: Dispatcher::new(),
            verifier,
            policy,
        })
    }
}

/// Health check, the relay upgrade and the authenticated REST routes.
pub fn build_router(state: ServerState, cors_origin: Option<&str>) -> anyhow::Result<Router> {
    let cors = match cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(HeaderValue::from_str(origin)?)
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::permissive(),
    };

    let relay = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state.clone());

    Ok(Router::new()
        .route("/health", get(health))
        .merge(huddle_api::routes::router(state.app))
        .merge(relay)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct GatewayParams {
    token: Option<String>,
}

/// The credential is checked before the upgrade, so a bad one gets a plain
/// 401 instead of a socket.
async fn ws_upgrade(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(params): Query<GatewayParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match credentials::authenticate(state.verifier.as_ref(), &headers, params.token.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Relay handshake refused: {}", e);
            return ApiError::from(e).into_response();
        }
    };

    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.dispatcher, identity, state.policy))
}
