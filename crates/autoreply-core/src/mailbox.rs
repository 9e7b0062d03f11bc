//! The mail-service contract the auto-reply worker depends on, and its Gmail binding.

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::gmail::{
    EmailAddress, GmailClient, GmailClientError, Label, LabelVisibility, Message, MimeBuildError,
    OAuthError, ReplyMime, SentMessage, TokenStore,
};

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("credential rejected by the mail service")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("conflicts with an existing resource")]
    Conflict,
    #[error("rate limited")]
    RateLimited,
    #[error("request rejected with status {0}")]
    Rejected(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("failed to build message: {0}")]
    Build(String),
}

impl MailboxError {
    /// 400 or 404: the referenced label or message id is no longer valid.
    pub fn is_stale_reference(&self) -> bool {
        matches!(self, MailboxError::NotFound | MailboxError::Rejected(400))
    }
}

impl From<GmailClientError> for MailboxError {
    fn from(err: GmailClientError) -> Self {
        match err {
            GmailClientError::Unauthorized => MailboxError::Unauthorized,
            // invalid_grant and friends: the refresh token itself is dead.
            GmailClientError::OAuth(OAuthError::MissingRefreshToken)
            | GmailClientError::OAuth(OAuthError::TokenEndpoint {
                status: 400 | 401, ..
            }) => MailboxError::Unauthorized,
            GmailClientError::OAuth(other) => MailboxError::Transport(other.to_string()),
            GmailClientError::TokenStore(msg) => MailboxError::Transport(msg),
            GmailClientError::Decode(err) => MailboxError::Decode(err.to_string()),
            GmailClientError::Http(http_err) => match http_err.status() {
                Some(StatusCode::UNAUTHORIZED) => MailboxError::Unauthorized,
                Some(StatusCode::NOT_FOUND) => MailboxError::NotFound,
                Some(StatusCode::CONFLICT) => MailboxError::Conflict,
                // Gmail reports userRateLimitExceeded as 403.
                Some(StatusCode::TOO_MANY_REQUESTS) | Some(StatusCode::FORBIDDEN) => {
                    MailboxError::RateLimited
                }
                Some(status) => MailboxError::Rejected(status.as_u16()),
                None => MailboxError::Transport(http_err.to_string()),
            },
        }
    }
}

impl From<MimeBuildError> for MailboxError {
    fn from(err: MimeBuildError) -> Self {
        MailboxError::Build(err.to_string())
    }
}

/// A message as the worker sees it. Absent labels or headers on the wire become
/// empty containers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MailMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub label_ids: BTreeSet<String>,
    pub headers: Vec<(String, String)>,
}

impl MailMessage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label_ids.insert(label.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header whose name matches exactly.
    pub fn header_exact(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header == name)
            .map(|(_, value)| value.as_str())
    }

    /// First header whose name matches ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl From<Message> for MailMessage {
    fn from(message: Message) -> Self {
        let headers = message
            .payload
            .map(|payload| {
                payload
                    .headers
                    .into_iter()
                    .map(|header| (header.name, header.value))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: message.id,
            thread_id: message.thread_id,
            label_ids: message.label_ids.into_iter().collect(),
            headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Filter for [`Mailbox::list_message_ids`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxQuery {
    pub query: String,
    pub label_ids: Vec<String>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingReply {
    pub thread_id: Option<String>,
    pub to: String,
    pub subject: String,
    pub body: String,
    /// `Message-ID` of the message being answered.
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn list_labels(&self) -> Result<Vec<Label>, MailboxError>;

    /// Fails with [`MailboxError::Conflict`] when a label with this name already exists.
    async fn create_label(
        &self,
        name: &str,
        visibility: LabelVisibility,
    ) -> Result<Label, MailboxError>;

    async fn list_message_ids(
        &self,
        query: &InboxQuery,
        page_token: Option<&str>,
    ) -> Result<MessagePage, MailboxError>;

    async fn get_message(&self, id: &str) -> Result<MailMessage, MailboxError>;

    async fn send_message(&self, reply: &OutgoingReply) -> Result<SentMessage, MailboxError>;

    async fn modify_message_labels(
        &self,
        id: &str,
        add_label_ids: &[String],
    ) -> Result<(), MailboxError>;
}

/// [`Mailbox`] over the Gmail REST API. The sending address comes from the account
/// profile and is fetched once.
pub struct GmailMailbox<S: TokenStore> {
    client: GmailClient<S>,
    sender: OnceCell<EmailAddress>,
}

impl<S: TokenStore> GmailMailbox<S> {
    pub fn new(client: GmailClient<S>) -> Self {
        Self {
            client,
            sender: OnceCell::new(),
        }
    }

    pub async fn sender(&self) -> Result<&EmailAddress, MailboxError> {
        self.sender
            .get_or_try_init(|| async {
                let profile = self.client.get_profile().await?;
                debug!(email = %profile.email_address, "resolved sending address");
                Ok::<_, MailboxError>(EmailAddress::from(profile.email_address.as_str()))
            })
            .await
    }
}

#[async_trait]
impl<S: TokenStore + 'static> Mailbox for GmailMailbox<S> {
    async fn list_labels(&self) -> Result<Vec<Label>, MailboxError> {
        Ok(self.client.list_labels().await?.labels)
    }

    async fn create_label(
        &self,
        name: &str,
        visibility: LabelVisibility,
    ) -> Result<Label, MailboxError> {
        Ok(self.client.create_label(name, visibility).await?)
    }

    async fn list_message_ids(
        &self,
        query: &InboxQuery,
        page_token: Option<&str>,
    ) -> Result<MessagePage, MailboxError> {
        let response = self
            .client
            .list_messages(
                Some(query.query.as_str()),
                &query.label_ids,
                page_token,
                query.page_size,
            )
            .await?;
        Ok(MessagePage {
            ids: response.messages.into_iter().map(|m| m.id).collect(),
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn get_message(&self, id: &str) -> Result<MailMessage, MailboxError> {
        Ok(self.client.get_message(id).await?.into())
    }

    async fn send_message(&self, reply: &OutgoingReply) -> Result<SentMessage, MailboxError> {
        let from = self.sender().await?.clone();
        let to = EmailAddress::parse(&reply.to)
            .ok_or_else(|| MailboxError::Build(format!("unparseable recipient {:?}", reply.to)))?;
        let raw = ReplyMime {
            from: Some(from),
            to,
            subject: reply.subject.clone(),
            body: reply.body.clone(),
            in_reply_to: reply.in_reply_to.clone(),
            references: reply.references.clone(),
        }
        .to_base64_url()?;

        Ok(self
            .client
            .send_message(&raw, reply.thread_id.as_deref())
            .await?)
    }

    async fn modify_message_labels(
        &self,
        id: &str,
        add_label_ids: &[String],
    ) -> Result<(), MailboxError> {
        self.client.modify_message(id, add_label_ids, &[]).await?;
        Ok(())
    }
}
