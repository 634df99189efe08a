use thiserror::Error;

use huddle_types::api::ErrorBody;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a structured failure.
    #[error("{status}: {}", body.message)]
    Api { status: u16, body: ErrorBody },

    /// Still unauthorized after a credential refresh.
    #[error("not signed in")]
    Unauthorized,

    #[error("credential refresh failed: {0}")]
    Refresh(String),

    #[error("relay connection failed: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The relay refused the handshake credential.
    #[error("relay rejected the credential")]
    HandshakeRejected,

    #[error("relay session closed")]
    Closed,

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Unauthorized | Self::HandshakeRejected => Some(401),
            _ => None,
        }
    }
}
