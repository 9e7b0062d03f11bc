pub mod client;
pub mod credentials;
pub mod mime_builder;
pub mod oauth;
pub mod types;

pub use client::{GmailClient, GmailClientError};
pub use credentials::{AuthorizedUser, ClientSecrets, CredentialsError, FileTokenStore};
pub use mime_builder::{EmailAddress, MimeBuildError, ReplyMime};
pub use oauth::{
    DEFAULT_REFRESH_BUFFER, GMAIL_MODIFY_SCOPE, OAuthApp, OAuthError, OAuthTokens, TokenStore,
};
pub use types::*;
