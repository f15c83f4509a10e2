use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::Serialize;

use crate::auth::{AuthStore, CookieRefresher, REFRESH_COOKIE};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{
    AgentRequest, AnalyzeRequest, ChatMessage, HighlightsRequest, HistoryRecord, TokenResponse,
};
use crate::stream::ChatStream;

pub const MESSAGES_PAGE_SIZE: u32 = 20;
pub const FOR_YOU: &str = "For You";

pub struct ClientConfig {
    pub base_url: String,
    pub connect_timeout: Option<Duration>,
}

/// One page of `/chat_messages`, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage {
    pub articles: Vec<serde_json::Value>,
    pub has_more: bool,
}

/// Tokens handed out by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginTokens {
    pub access_token: String,
    /// Taken from the `refresh_token` cookie, when the backend sets one.
    pub refresh_token: Option<String>,
}

#[derive(Clone)]
pub struct NewsClient {
    base_url: String,
    http: HttpClient,
    auth: Arc<AuthStore>,
}

impl NewsClient {
    pub fn new(config: ClientConfig, auth: Arc<AuthStore>) -> ClientResult<Self> {
        let mut builder = HttpClient::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        Ok(Self {
            base_url: normalize_base_url(&config.base_url),
            http: builder.build()?,
            auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    /// Sends one chat turn and returns its event stream.
    pub async fn ask(
        &self,
        user_query: &str,
        session_id: &str,
        new_session: bool,
    ) -> ClientResult<ChatStream> {
        let request = AgentRequest {
            user_query: user_query.to_string(),
            session_id: session_id.to_string(),
            new_session,
        };
        self.open_stream("/agent_test", &request).await
    }

    pub async fn analyze(&self, article_id: i64, session_id: &str) -> ClientResult<ChatStream> {
        let request = AnalyzeRequest {
            article_id,
            session_id: session_id.to_string(),
        };
        self.open_stream("/ai_analyze", &request).await
    }

    pub async fn highlights(&self, query: &str, session_id: &str) -> ClientResult<ChatStream> {
        let request = HighlightsRequest {
            query: query.to_string(),
            session_id: session_id.to_string(),
        };
        self.open_stream("/highlights", &request).await
    }

    async fn open_stream<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> ClientResult<ChatStream> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .send_authorized(|http| http.post(&url).json(body))
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::from_response("Failed to open stream", response).await);
        }

        tracing::debug!(path, "chat stream opened");
        Ok(ChatStream::from_response(response))
    }

    pub async fn chat_messages(&self, session_id: &str, page: u32) -> ClientResult<HistoryPage> {
        let url = format!("{}/chat_messages", self.base_url);
        let page = page.to_string();
        let limit = MESSAGES_PAGE_SIZE.to_string();
        let response = self
            .send_authorized(|http| {
                http.get(&url).query(&[
                    ("sessionId", session_id),
                    ("page", page.as_str()),
                    ("limit", limit.as_str()),
                ])
            })
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::from_response("Failed to load messages", response).await);
        }

        let records: Vec<HistoryRecord> = response.json().await?;
        let has_more = records.len() >= MESSAGES_PAGE_SIZE as usize;
        let messages = records.into_iter().rev().map(ChatMessage::from).collect();
        Ok(HistoryPage { messages, has_more })
    }

    /// Fetches a feed page. Failures degrade to an empty page.
    pub async fn feed(&self, topic: &str, page: u32) -> FeedPage {
        match self.try_feed(topic, page).await {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(topic, error = %err, "error fetching feed");
                FeedPage {
                    articles: Vec::new(),
                    has_more: false,
                }
            }
        }
    }

    async fn try_feed(&self, topic: &str, page: u32) -> ClientResult<FeedPage> {
        let url = if topic == FOR_YOU {
            format!("{}/foryou", self.base_url)
        } else {
            format!("{}/feed/{}", self.base_url, topic)
        };
        let page = page.to_string();
        let response = self
            .send_authorized(|http| http.get(&url).query(&[("page", page.as_str())]))
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::from_response("Failed to load feed", response).await);
        }

        let articles = match response.json::<serde_json::Value>().await? {
            serde_json::Value::Array(items) => items,
            _ => Vec::new(),
        };
        let has_more = !articles.is_empty();
        Ok(FeedPage { articles, has_more })
    }

    /// Deletes one session and its messages.
    pub async fn delete_session(&self, session_id: &str) -> ClientResult<()> {
        let url = format!("{}/chat_session", self.base_url);
        let response = self
            .send_authorized(|http| http.delete(&url).query(&[("sessionId", session_id)]))
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::from_response("Failed to delete chat", response).await);
        }
        tracing::info!(session_id, "chat session deleted");
        Ok(())
    }

    /// Deletes every session the user has.
    pub async fn delete_history(&self) -> ClientResult<()> {
        let url = format!("{}/chat_history", self.base_url);
        let response = self.send_authorized(|http| http.delete(&url)).await?;

        if !response.status().is_success() {
            return Err(ClientError::from_response("Failed to delete chats", response).await);
        }
        tracing::info!("chat history deleted");
        Ok(())
    }

    /// Logs in with the password form. The access token and the refresh
    /// cookie both go into the auth store.
    pub async fn login(&self, username: &str, password: &str) -> ClientResult<LoginTokens> {
        let response = self
            .http
            .post(format!("{}/token", self.base_url))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(ClientError::from_response("Login failed", response).await);
        }

        let refresh_token = response
            .cookies()
            .find(|cookie| cookie.name() == REFRESH_COOKIE)
            .map(|cookie| cookie.value().to_string());
        let body: TokenResponse = response.json().await?;

        self.auth.set_token(Some(body.access_token.clone())).await;
        match &refresh_token {
            Some(refresh) => {
                let refresher = CookieRefresher::new(refresh.clone());
                self.auth.set_refresher(Some(Arc::new(refresher))).await;
            }
            None => tracing::warn!("login response carried no refresh cookie"),
        }

        Ok(LoginTokens {
            access_token: body.access_token,
            refresh_token,
        })
    }

    /// Logs out; the local token is dropped even if the call fails.
    pub async fn logout(&self) -> ClientResult<()> {
        let result = self
            .http
            .post(format!("{}/logout", self.base_url))
            .send()
            .await;
        self.auth.set_token(None).await;
        self.auth.set_refresher(None).await;

        match result {
            Ok(response) if !response.status().is_success() => {
                Err(ClientError::from_response("Logout failed", response).await)
            }
            Ok(_) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Sends a request with the bearer token, refreshing once on 401.
    async fn send_authorized<F>(&self, build: F) -> ClientResult<Response>
    where
        F: Fn(&HttpClient) -> RequestBuilder,
    {
        let token = self.auth.token().await;
        let response = with_bearer(build(&self.http), token.as_deref())
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        if !self.auth.can_refresh().await {
            return Err(ClientError::Unauthorized);
        }

        tracing::info!("access token rejected, refreshing");
        let token = self.auth.refresh(&self.http, &self.base_url).await?;
        let response = with_bearer(build(&self.http), Some(&token)).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        Ok(response)
    }
}

fn with_bearer(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
