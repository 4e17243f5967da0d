//! HTTP client for the chat read APIs.
//!
//! The broker only pushes what happens after a subscription starts, so history,
//! the conversation list and search come from these endpoints instead.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use shopchat_shared::{ApiError, ChatMessage, ConversationInfo, Page};

const CONVERSATIONS_PATH: &str = "/api/chat/conversations";
const MESSAGES_PATH: &str = "/api/chat/messages";
const HISTORY_PAGE_SIZE: u32 = 50;

/// Read APIs the sync layer depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Conversations the current user participates in.
    async fn fetch_conversations(&self) -> Result<Vec<ConversationInfo>, ApiError>;

    /// Latest page of a conversation's history.
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ApiError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError>;

    async fn search_messages(&self, keyword: &str) -> Result<Vec<ChatMessage>, ApiError>;
}

/// HTTP client for making bearer-authenticated API requests.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            token: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Attach a bearer token to every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }

    /// Send with the bearer token and return the body of a 2xx response.
    /// Anything else becomes `ApiError::Http` carrying the raw body, so
    /// callers can pull a problem+json detail out of it.
    async fn execute(&self, rb: RequestBuilder) -> Result<String, ApiError> {
        let rb = match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        };
        let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(ApiError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let body = self.execute(self.client.get(self.url(path))).await?;
        serde_json::from_str(&body).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(self.client.delete(self.url(path))).await.map(drop)
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationInfo>, ApiError> {
        self.get_json(CONVERSATIONS_PATH).await
    }

    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ApiError> {
        let path = format!(
            "{}/{}/messages?page=0&size={}",
            CONVERSATIONS_PATH,
            urlencoding::encode(conversation_id),
            HISTORY_PAGE_SIZE
        );
        let page: Page<ChatMessage> = self.get_json(&path).await?;
        Ok(page.content)
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError> {
        self.delete(&format!("{}/{}", MESSAGES_PATH, urlencoding::encode(message_id)))
            .await
    }

    async fn search_messages(&self, keyword: &str) -> Result<Vec<ChatMessage>, ApiError> {
        let path = format!("{}/search?keyword={}", MESSAGES_PATH, urlencoding::encode(keyword));
        self.get_json(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path() {
        let client = ApiClient::new().with_base_url("https://shop.example.com/");
        assert_eq!(
            client.url("/api/chat/conversations"),
            "https://shop.example.com/api/chat/conversations"
        );
        assert_eq!(client.url("https://other/x"), "https://other/x");
        assert_eq!(ApiClient::new().url("api/x"), "/api/x");
    }
}
