use std::sync::Arc;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use huddle_types::api::{
    ChatDetail, ChatWithMembers, CreateChatRequest, CreateMessageRequest, EditMessageRequest,
    ErrorBody, HistoryPage, HistoryQuery, LeaveResponse, MarkReadRequest,
};
use huddle_types::models::{DeletedMessage, MessageRecord, ReadReceipt};

use crate::credentials::TokenStore;
use crate::error::ClientError;

/// REST access to the message lifecycle. Every call carries the shared
/// bearer credential; a 401 triggers one refresh and one retry.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tokens: Arc<TokenStore>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute<T, F>(&self, build: F) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let token = self.tokens.current().await;
        let resp = authorized(build(&self.http), token.as_deref()).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return decode(resp).await;
        }

        tracing::debug!("request unauthorized, refreshing credential");
        let fresh = self.tokens.refresh().await?;
        let retried = authorized(build(&self.http), Some(&fresh)).send().await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        decode(retried).await
    }

    pub async fn history(&self, chat_id: Uuid, query: &HistoryQuery) -> Result<HistoryPage, ClientError> {
        let url = self.url(&format!("/chats/{}/messages", chat_id));
        self.execute(|http| http.get(&url).query(query)).await
    }

    pub async fn send_message(
        &self,
        chat_id: Uuid,
        req: &CreateMessageRequest,
    ) -> Result<MessageRecord, ClientError> {
        let url = self.url(&format!("/chats/{}/messages", chat_id));
        self.execute(|http| http.post(&url).json(req)).await
    }

    pub async fn edit_message(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        content: &str,
    ) -> Result<MessageRecord, ClientError> {
        let url = self.url(&format!("/chats/{}/messages/{}", chat_id, message_id));
        let body = EditMessageRequest {
            content: content.to_string(),
        };
        self.execute(|http| http.patch(&url).json(&body)).await
    }

    pub async fn delete_message(&self, chat_id: Uuid, message_id: Uuid) -> Result<DeletedMessage, ClientError> {
        let url = self.url(&format!("/chats/{}/messages/{}", chat_id, message_id));
        self.execute(|http| http.delete(&url)).await
    }

    pub async fn mark_read(&self, chat_id: Uuid, message_id: Uuid) -> Result<ReadReceipt, ClientError> {
        let url = self.url(&format!("/chats/{}/read", chat_id));
        let body = MarkReadRequest { message_id };
        self.execute(|http| http.post(&url).json(&body)).await
    }

    pub async fn create_chat(&self, req: &CreateChatRequest) -> Result<ChatWithMembers, ClientError> {
        let url = self.url("/chats");
        self.execute(|http| http.post(&url).json(req)).await
    }

    pub async fn get_chat(&self, chat_id: Uuid) -> Result<ChatDetail, ClientError> {
        let url = self.url(&format!("/chats/{}", chat_id));
        self.execute(|http| http.get(&url)).await
    }

    pub async fn leave_chat(&self, chat_id: Uuid) -> Result<LeaveResponse, ClientError> {
        let url = self.url(&format!("/chats/{}/members/me", chat_id));
        self.execute(|http| http.delete(&url)).await
    }
}

fn authorized(req: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => req.bearer_auth(token),
        None => req,
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }

    let bytes = resp.bytes().await?;
    let body = serde_json::from_slice::<ErrorBody>(&bytes).unwrap_or_else(|_| ErrorBody {
        error: "http".into(),
        message: String::from_utf8_lossy(&bytes).into_owned(),
        existing_chat_id: None,
    });
    Err(ClientError::Api {
        status: status.as_u16(),
        body,
    })
}
