use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// Sending replies and applying labels both need modify access.
pub const GMAIL_MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::minutes(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl OAuthTokens {
    /// Tokens loaded from disk with only a refresh token; the first request refreshes them.
    pub fn from_refresh_token(refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: refresh_token.into(),
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.access_token.is_empty() || now + buffer >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("missing refresh token")]
    MissingRefreshToken,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
    #[error("invalid authorization url: {0}")]
    Url(String),
}

/// Persists tokens after a refresh so the next run starts from them.
#[async_trait]
pub trait TokenStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// An installed OAuth application: client credentials plus the endpoints it talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
    pub auth_endpoint: String,
    pub token_endpoint: String,
}

impl OAuthApp {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_endpoint: AUTH_ENDPOINT.to_string(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
        }
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    /// Consent URL for the authorization-code flow. Requests offline access and forces
    /// the consent screen so Google always returns a refresh token.
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        scopes: &[String],
        state: &str,
    ) -> Result<Url, OAuthError> {
        let scope_value = scopes.join(" ");
        let url = Url::parse_with_params(
            &self.auth_endpoint,
            [
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scope_value.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
                ("include_granted_scopes", "true"),
            ],
        )
        .map_err(|err| OAuthError::Url(err.to_string()))?;
        Ok(url)
    }

    pub async fn exchange_code(
        &self,
        http: &reqwest::Client,
        code: &str,
        redirect_uri: &str,
    ) -> Result<OAuthTokens, OAuthError> {
        let payload = self
            .request_token(
                http,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.as_str()),
                    ("redirect_uri", redirect_uri),
                ],
            )
            .await?;

        let refresh_token = payload
            .refresh_token
            .filter(|token| !token.is_empty())
            .ok_or(OAuthError::MissingRefreshToken)?;

        Ok(OAuthTokens {
            access_token: payload.access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(payload.expires_in),
        })
    }

    pub async fn refresh(
        &self,
        http: &reqwest::Client,
        tokens: &OAuthTokens,
    ) -> Result<OAuthTokens, OAuthError> {
        if tokens.refresh_token.is_empty() {
            return Err(OAuthError::MissingRefreshToken);
        }

        let payload = self
            .request_token(
                http,
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.as_str()),
                    ("refresh_token", tokens.refresh_token.as_str()),
                ],
            )
            .await?;

        // Google only rotates the refresh token occasionally.
        let refresh_token = payload
            .refresh_token
            .unwrap_or_else(|| tokens.refresh_token.clone());

        Ok(OAuthTokens {
            access_token: payload.access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(payload.expires_in),
        })
    }

    async fn request_token(
        &self,
        http: &reqwest::Client,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, OAuthError> {
        let response = http.post(&self.token_endpoint).form(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let payload: TokenResponse = serde_json::from_str(&body)?;
        if payload.expires_in <= 0 {
            return Err(OAuthError::InvalidExpires(payload.expires_in));
        }
        Ok(payload)
    }
}
