use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::gmail::oauth::{OAuthApp, OAuthTokens, TokenStore};

const AUTHORIZED_USER: &str = "authorized_user";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} has neither an \"installed\" nor a \"web\" client")]
    MissingClient(PathBuf),
    #[error("unsupported credential type {0:?}, expected \"authorized_user\"")]
    UnsupportedType(String),
    #[error("token file has an empty refresh_token")]
    EmptyRefreshToken,
}

/// OAuth client secrets as downloaded from the Google Cloud console.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub async fn load(path: &Path) -> Result<Self, CredentialsError> {
        let raw = read(path).await?;
        Self::parse(path, &raw)
    }

    fn parse(path: &Path, raw: &str) -> Result<Self, CredentialsError> {
        let file: ClientSecretsFile = serde_json::from_str(raw).map_err(|source| {
            CredentialsError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        file.installed
            .or(file.web)
            .ok_or_else(|| CredentialsError::MissingClient(path.to_path_buf()))
    }

    pub fn oauth_app(&self) -> OAuthApp {
        OAuthApp::new(self.client_id.clone(), self.client_secret.clone())
    }
}

/// Contents of the token file. The first four fields match the `authorized_user`
/// format understood by Google client libraries; the access token is cached alongside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedUser {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl AuthorizedUser {
    pub fn new(app: &OAuthApp, tokens: &OAuthTokens) -> Self {
        Self {
            kind: AUTHORIZED_USER.to_string(),
            client_id: app.client_id.clone(),
            client_secret: app.client_secret.clone(),
            refresh_token: tokens.refresh_token.clone(),
            access_token: (!tokens.access_token.is_empty()).then(|| tokens.access_token.clone()),
            expiry: (!tokens.access_token.is_empty()).then_some(tokens.expires_at),
        }
    }

    pub async fn load(path: &Path) -> Result<Self, CredentialsError> {
        let raw = read(path).await?;
        let user: AuthorizedUser =
            serde_json::from_str(&raw).map_err(|source| CredentialsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if user.kind != AUTHORIZED_USER {
            return Err(CredentialsError::UnsupportedType(user.kind));
        }
        if user.refresh_token.trim().is_empty() {
            return Err(CredentialsError::EmptyRefreshToken);
        }
        Ok(user)
    }

    /// Write the file next to its destination and rename it into place so a crash
    /// never leaves a truncated token file behind.
    pub async fn save(&self, path: &Path) -> Result<(), CredentialsError> {
        let io_err = |source| CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let body = serde_json::to_vec_pretty(self).map_err(|source| CredentialsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }

    pub fn oauth_app(&self) -> OAuthApp {
        OAuthApp::new(self.client_id.clone(), self.client_secret.clone())
    }

    pub fn tokens(&self) -> OAuthTokens {
        match (&self.access_token, self.expiry) {
            (Some(access_token), Some(expires_at)) if !access_token.is_empty() => OAuthTokens {
                access_token: access_token.clone(),
                refresh_token: self.refresh_token.clone(),
                expires_at,
            },
            _ => OAuthTokens::from_refresh_token(self.refresh_token.clone()),
        }
    }
}

/// Rewrites the token file whenever the client refreshes its access token.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
    app: OAuthApp,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>, app: OAuthApp) -> Self {
        Self {
            path: path.into(),
            app,
        }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    type Error = CredentialsError;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error> {
        AuthorizedUser::new(&self.app, tokens)
            .save(&self.path)
            .await?;
        debug!(path = %self.path.display(), "persisted refreshed tokens");
        Ok(())
    }
}

async fn read(path: &Path) -> Result<String, CredentialsError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn client_secrets_accepts_installed_and_web() {
        let path = Path::new("credentials.json");
        let installed = json!({
            "installed": {
                "client_id": "installed-id",
                "client_secret": "installed-secret",
                "redirect_uris": ["http://localhost"]
            }
        });
        let secrets = ClientSecrets::parse(path, &installed.to_string()).expect("installed");
        assert_eq!(secrets.client_id, "installed-id");
        assert_eq!(secrets.redirect_uris, vec!["http://localhost".to_string()]);

        let web = json!({
            "web": { "client_id": "web-id", "client_secret": "web-secret" }
        });
        let secrets = ClientSecrets::parse(path, &web.to_string()).expect("web");
        assert_eq!(secrets.client_id, "web-id");
        assert_eq!(secrets.oauth_app().client_secret, "web-secret");
    }

    #[test]
    fn client_secrets_without_client_section_errors() {
        let err = ClientSecrets::parse(Path::new("credentials.json"), "{}")
            .expect_err("no client section");
        assert!(matches!(err, CredentialsError::MissingClient(_)));
    }

    #[tokio::test]
    async fn authorized_user_round_trips_through_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("nested/token.json");
        let tokens = OAuthTokens {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        let app = OAuthApp::new("client", "secret");

        AuthorizedUser::new(&app, &tokens)
            .save(&path)
            .await
            .expect("save token file");
        let loaded = AuthorizedUser::load(&path).await.expect("load token file");

        assert_eq!(loaded.kind, "authorized_user");
        assert_eq!(loaded.oauth_app(), app);
        assert_eq!(loaded.tokens(), tokens);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn refresh_token_only_file_loads_as_expired_tokens() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("token.json");
        let body = json!({
            "type": "authorized_user",
            "client_id": "client",
            "client_secret": "secret",
            "refresh_token": "refresh"
        });
        tokio::fs::write(&path, body.to_string()).await.expect("write");

        let tokens = AuthorizedUser::load(&path).await.expect("load").tokens();
        assert_eq!(tokens.refresh_token, "refresh");
        assert!(tokens.needs_refresh(Utc::now(), Duration::zero()));
    }

    #[tokio::test]
    async fn load_rejects_missing_and_malformed_files() {
        let dir = TempDir::new().expect("temp dir");
        let missing = dir.path().join("absent.json");
        let err = AuthorizedUser::load(&missing).await.expect_err("missing");
        assert!(matches!(err, CredentialsError::Io { .. }));

        let wrong_type = dir.path().join("service.json");
        let body = json!({
            "type": "service_account",
            "client_id": "c",
            "client_secret": "s",
            "refresh_token": "r"
        });
        tokio::fs::write(&wrong_type, body.to_string()).await.expect("write");
        let err = AuthorizedUser::load(&wrong_type).await.expect_err("wrong type");
        assert!(matches!(err, CredentialsError::UnsupportedType(kind) if kind == "service_account"));

        let empty_refresh = dir.path().join("empty.json");
        let body = json!({
            "type": "authorized_user",
            "client_id": "c",
            "client_secret": "s",
            "refresh_token": ""
        });
        tokio::fs::write(&empty_refresh, body.to_string()).await.expect("write");
        let err = AuthorizedUser::load(&empty_refresh).await.expect_err("empty refresh");
        assert!(matches!(err, CredentialsError::EmptyRefreshToken));
    }

    #[tokio::test]
    async fn file_token_store_persists_refreshed_tokens() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("token.json");
        let store = FileTokenStore::new(&path, OAuthApp::new("client", "secret"));
        let tokens = OAuthTokens {
            access_token: "fresh".into(),
            refresh_token: "rotated".into(),
            expires_at: Utc::now() + Duration::minutes(50),
        };

        store.save_tokens(&tokens).await.expect("save");

        let loaded = AuthorizedUser::load(&store.path).await.expect("load");
        assert_eq!(loaded.refresh_token, "rotated");
        assert_eq!(loaded.access_token.as_deref(), Some("fresh"));
    }
}
