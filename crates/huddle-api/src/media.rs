use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use huddle_types::models::MediaKind;

/// Upload ceiling for a single attachment.
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

pub const ALLOWED_FORMATS: &[&str] = &["jpg", "jpeg", "png", "webp", "mp4"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaRejection {
    #[error("attachments are not enabled on this server")]
    NotConfigured,
    #[error("resource {0} was not uploaded for this chat")]
    OutsideUploadArea(String),
    #[error("resource is {0} bytes, the limit is 10 MiB")]
    TooLarge(u64),
    #[error("unsupported attachment format '{0}'")]
    UnsupportedFormat(String),
    #[error("resource {0} does not exist")]
    Missing(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Resource description as reported by the media store.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaMetadata {
    pub public_id: String,
    #[serde(default)]
    pub folder: Option<String>,
    pub secure_url: String,
    pub bytes: u64,
    pub format: String,
    #[serde(default)]
    pub resource_type: Option<String>,
}

/// An attachment that passed verification and may be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMedia {
    pub url: String,
    pub kind: MediaKind,
}

pub trait MediaVerifier: Send + Sync {
    fn verify<'a>(&'a self, chat_id: Uuid, public_id: &'a str) -> BoxFuture<'a, Result<VerifiedMedia, MediaRejection>>;
}

/// Ownership, size and format rules applied to a resource's metadata.
pub fn check_resource(chat_id: Uuid, meta: &MediaMetadata) -> Result<VerifiedMedia, MediaRejection> {
    let upload_area = format!("temp/chats/{}", chat_id);
    let owned = meta.public_id.contains(&upload_area)
        || meta.folder.as_deref().is_some_and(|f| f.contains(&upload_area));
    if !owned {
        return Err(MediaRejection::OutsideUploadArea(meta.public_id.clone()));
    }

    if meta.bytes > MAX_ATTACHMENT_BYTES {
        return Err(MediaRejection::TooLarge(meta.bytes));
    }

    let format = meta.format.to_ascii_lowercase();
    if !ALLOWED_FORMATS.contains(&format.as_str()) {
        return Err(MediaRejection::UnsupportedFormat(meta.format.clone()));
    }

    let kind = meta
        .resource_type
        .as_deref()
        .and_then(MediaKind::parse)
        .unwrap_or(if format == "mp4" { MediaKind::Video } else { MediaKind::Image });

    Ok(VerifiedMedia {
        url: meta.secure_url.clone(),
        kind,
    })
}

/// Looks resources up in the media metadata service at
/// `{base_url}/resources/{public_id}`.
pub struct HttpMediaVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMediaVerifier {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn lookup(&self, public_id: &str) -> Result<MediaMetadata, MediaRejection> {
        let url = format!("{}/resources/{}", self.base_url, public_id);
        let resp = self.client.get(&url).send().await.map_err(|e| {
            warn!("Media lookup for {} failed: {}", public_id, e);
            MediaRejection::Unavailable(e.to_string())
        })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(MediaRejection::Missing(public_id.to_string()));
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| MediaRejection::Unavailable(e.to_string()))?;

        resp.json::<MediaMetadata>()
            .await
            .map_err(|e| MediaRejection::Unavailable(e.to_string()))
    }
}

impl MediaVerifier for HttpMediaVerifier {
    fn verify<'a>(&'a self, chat_id: Uuid, public_id: &'a str) -> BoxFuture<'a, Result<VerifiedMedia, MediaRejection>> {
        async move {
            let meta = self.lookup(public_id).await?;
            check_resource(chat_id, &meta)
        }
        .boxed()
    }
}

/// Used when no media service is configured: every attachment is refused.
pub struct NoMedia;

impl MediaVerifier for NoMedia {
    fn verify<'a>(&'a self, _chat_id: Uuid, _public_id: &'a str) -> BoxFuture<'a, Result<VerifiedMedia, MediaRejection>> {
        async { Err(MediaRejection::NotConfigured) }.boxed()
    }
}
