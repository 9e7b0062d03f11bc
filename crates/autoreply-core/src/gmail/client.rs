use std::sync::Arc;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::gmail::{
    oauth::{DEFAULT_REFRESH_BUFFER, OAuthApp, OAuthError, OAuthTokens, TokenStore},
    types::{
        CreateLabelRequest, Label, LabelVisibility, ListLabelsResponse, ListMessagesResponse,
        Message, ModifyMessageRequest, Profile, SendMessageRequest, SentMessage,
    },
};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";

/// Headers requested with `format=metadata`; everything the reply decision and the
/// reply itself read.
pub const METADATA_HEADERS: [&str; 5] = ["From", "Subject", "Message-ID", "In-Reply-To", "References"];

#[derive(Debug, Error)]
pub enum GmailClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("token persistence error: {0}")]
    TokenStore(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unauthorized after refresh")]
    Unauthorized,
}

pub struct GmailClient<S: TokenStore> {
    http: Client,
    user_id: String,
    app: OAuthApp,
    api_base: String,
    tokens: RwLock<OAuthTokens>,
    refresh_lock: Mutex<()>,
    token_store: Arc<S>,
}

impl<S: TokenStore> GmailClient<S> {
    pub fn new(
        http: Client,
        user_id: impl Into<String>,
        app: OAuthApp,
        initial_tokens: OAuthTokens,
        token_store: Arc<S>,
    ) -> Self {
        Self {
            http,
            user_id: user_id.into(),
            app,
            api_base: DEFAULT_API_BASE.to_string(),
            tokens: RwLock::new(initial_tokens),
            refresh_lock: Mutex::new(()),
            token_store,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub async fn get_profile(&self) -> Result<Profile, GmailClientError> {
        let url = format!("{}/{}/profile", self.api_base, self.user_id);
        self.send_json(|| self.http.get(&url)).await
    }

    pub async fn list_labels(&self) -> Result<ListLabelsResponse, GmailClientError> {
        let url = format!("{}/{}/labels", self.api_base, self.user_id);
        self.send_json(|| self.http.get(&url)).await
    }

    /// Creates a label. Gmail answers 409 when the name is already taken.
    pub async fn create_label(
        &self,
        name: &str,
        visibility: LabelVisibility,
    ) -> Result<Label, GmailClientError> {
        let url = format!("{}/{}/labels", self.api_base, self.user_id);
        let body = CreateLabelRequest {
            name,
            label_list_visibility: visibility.label_list,
            message_list_visibility: visibility.message_list,
        };
        self.send_json(|| self.http.post(&url).json(&body)).await
    }

    pub async fn list_messages(
        &self,
        query: Option<&str>,
        label_ids: &[String],
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListMessagesResponse, GmailClientError> {
        let url = format!("{}/{}/messages", self.api_base, self.user_id);
        self.send_json(|| {
            let mut builder = self.http.get(&url);
            if let Some(q) = query.filter(|q| !q.is_empty()) {
                builder = builder.query(&[("q", q)]);
            }
            for label in label_ids {
                builder = builder.query(&[("labelIds", label.as_str())]);
            }
            if let Some(token) = page_token {
                builder = builder.query(&[("pageToken", token)]);
            }
            if let Some(max) = max_results {
                builder = builder.query(&[("maxResults", max)]);
            }
            builder
        })
        .await
    }

    /// Fetches labels and the headers in [`METADATA_HEADERS`]; bodies are not needed.
    pub async fn get_message(&self, message_id: &str) -> Result<Message, GmailClientError> {
        let url = format!("{}/{}/messages/{}", self.api_base, self.user_id, message_id);
        self.send_json(|| {
            let mut builder = self.http.get(&url).query(&[("format", "metadata")]);
            for header in METADATA_HEADERS {
                builder = builder.query(&[("metadataHeaders", header)]);
            }
            builder
        })
        .await
    }

    /// Sends a base64url-encoded RFC 5322 message, optionally into an existing thread.
    pub async fn send_message(
        &self,
        raw: &str,
        thread_id: Option<&str>,
    ) -> Result<SentMessage, GmailClientError> {
        let url = format!("{}/{}/messages/send", self.api_base, self.user_id);
        let body = SendMessageRequest { raw, thread_id };
        self.send_json(|| self.http.post(&url).json(&body)).await
    }

    pub async fn modify_message(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<Message, GmailClientError> {
        let url = format!(
            "{}/{}/messages/{}/modify",
            self.api_base, self.user_id, message_id
        );
        let body = ModifyMessageRequest {
            add_label_ids,
            remove_label_ids,
        };
        self.send_json(|| self.http.post(&url).json(&body)).await
    }

    async fn send_json<T, B>(&self, build: B) -> Result<T, GmailClientError>
    where
        T: DeserializeOwned,
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let response = self.perform_authenticated(build).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(GmailClientError::Decode)
    }

    async fn perform_authenticated<B>(
        &self,
        build: B,
    ) -> Result<reqwest::Response, GmailClientError>
    where
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let tokens = self.ensure_fresh_token(false).await?;
        let mut response = build().bearer_auth(&tokens.access_token).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("access token rejected, forcing refresh");
            let tokens = self.ensure_fresh_token(true).await?;
            response = build().bearer_auth(&tokens.access_token).send().await?;
        }

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(GmailClientError::Unauthorized);
        }

        Ok(response.error_for_status()?)
    }

    async fn ensure_fresh_token(
        &self,
        force_refresh: bool,
    ) -> Result<OAuthTokens, GmailClientError> {
        let stale = {
            let tokens = self.tokens.read().await;
            if !force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER) {
                return Ok(tokens.clone());
            }
            tokens.access_token.clone()
        };

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        {
            let tokens = self.tokens.read().await;
            let refreshed_meanwhile = force_refresh && tokens.access_token != stale;
            if refreshed_meanwhile
                || (!force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER))
            {
                return Ok(tokens.clone());
            }
        }

        let current = { self.tokens.read().await.clone() };
        let refreshed = self.app.refresh(&self.http, &current).await?;

        {
            let mut tokens = self.tokens.write().await;
            *tokens = refreshed.clone();
        }

        self.token_store
            .save_tokens(&refreshed)
            .await
            .map_err(|err| GmailClientError::TokenStore(err.to_string()))?;

        debug!(expires_at = %refreshed.expires_at, "refreshed access token");
        Ok(refreshed)
    }
}
