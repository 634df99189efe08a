use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::header::{COOKIE, SET_COOKIE};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::ClientError;
use crate::single_flight::SingleFlight;

const REFRESH_COOKIE: &str = "refreshToken";

/// Obtains a fresh access credential.
pub trait Refresher: Send + Sync {
    fn refresh(&self) -> BoxFuture<'static, Result<String, ClientError>>;
}

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
}

/// Refresh against an HTTP endpoint that reads a refresh cookie and may
/// rotate it.
pub struct HttpRefresher {
    client: reqwest::Client,
    url: String,
    refresh_token: Arc<Mutex<Option<String>>>,
}

impl HttpRefresher {
    pub fn new(client: reqwest::Client, url: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            refresh_token: Arc::new(Mutex::new(refresh_token)),
        }
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.refresh_token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Refresher for HttpRefresher {
    fn refresh(&self) -> BoxFuture<'static, Result<String, ClientError>> {
        let client = self.client.clone();
        let url = self.url.clone();
        let stored = self.refresh_token.clone();

        async move {
            let current = stored.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let mut request = client.post(&url);
            if let Some(token) = current {
                request = request.header(COOKIE, format!("{}={}", REFRESH_COOKIE, token));
            }

            let resp = request.send().await?;
            if !resp.status().is_success() {
                return Err(ClientError::Refresh(format!("refresh returned {}", resp.status())));
            }

            let rotated = resp
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find_map(cookie_value);
            if let Some(rotated) = rotated {
                *stored.lock().unwrap_or_else(|e| e.into_inner()) = Some(rotated);
            }

            let body: RefreshResponse = resp.json().await?;
            Ok(body.access_token)
        }
        .boxed()
    }
}

/// `refreshToken=abc; Path=/; HttpOnly` -> `abc`
fn cookie_value(header: &str) -> Option<String> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    (name.trim() == REFRESH_COOKIE && !value.is_empty()).then(|| value.trim().to_string())
}

/// The access credential shared by the REST client and the relay session.
/// Concurrent refreshes collapse into one.
pub struct TokenStore {
    token: RwLock<Option<String>>,
    refresher: Arc<dyn Refresher>,
    flight: SingleFlight<Result<String, String>>,
}

impl TokenStore {
    pub fn new(initial: Option<String>, refresher: Arc<dyn Refresher>) -> Self {
        Self {
            token: RwLock::new(initial),
            refresher,
            flight: SingleFlight::new(),
        }
    }

    pub async fn current(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn set(&self, token: String) {
        *self.token.write().await = Some(token);
    }

    pub async fn clear(&self) {
        *self.token.write().await = None;
    }

    /// Fetch a new credential, joining a refresh that is already running.
    /// A failed refresh clears the stored credential.
    pub async fn refresh(&self) -> Result<String, ClientError> {
        let refresher = self.refresher.clone();
        let outcome = self
            .flight
            .run(move || async move { refresher.refresh().await.map_err(|e| e.to_string()) })
            .await;

        match outcome {
            Ok(token) => {
                self.set(token.clone()).await;
                Ok(token)
            }
            Err(reason) => {
                tracing::warn!("credential refresh failed: {}", reason);
                self.clear().await;
                Err(ClientError::Refresh(reason))
            }
        }
    }
}
