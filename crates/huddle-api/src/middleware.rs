use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use huddle_gateway::credentials::{CredentialError, bearer_token};

use crate::error::ApiError;
use crate::state::AppState;

/// Verify the bearer credential and stash the caller's `Identity` in the
/// request extensions.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers()).ok_or(CredentialError::Missing)?;

    let identity = state.verifier.verify(&token).map_err(|e| {
        debug!("Rejected credential on {}: {}", req.uri().path(), e);
        e
    })?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
