use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use mail_builder::MessageBuilder;
use mail_builder::headers::address::Address;
use mail_builder::headers::message_id::MessageId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub email: String,
    pub name: Option<String>,
}

impl EmailAddress {
    pub fn new(name: Option<impl Into<String>>, email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.map(|n| n.into()),
        }
    }

    /// Parse a single header mailbox such as `"Ada" <ada@example.com>` or a bare address.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        if let (Some(start), Some(end)) = (input.find('<'), input.rfind('>')) {
            if start < end {
                let email = input[start + 1..end].trim();
                if email.is_empty() {
                    return None;
                }
                let display = input[..start].trim();
                let name = (!display.is_empty()).then(|| unquote(display));
                return Some(Self {
                    email: email.to_string(),
                    name,
                });
            }
        }

        let bare = input.trim_matches(|c| c == '<' || c == '>').trim();
        (!bare.is_empty()).then(|| Self {
            email: bare.to_string(),
            name: None,
        })
    }
}

impl From<&str> for EmailAddress {
    fn from(email: &str) -> Self {
        Self {
            email: email.to_string(),
            name: None,
        }
    }
}

fn unquote(input: &str) -> String {
    input
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(input)
        .replace("\\\"", "\"")
}

/// A plain-text reply threaded under an existing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMime {
    pub from: Option<EmailAddress>,
    pub to: EmailAddress,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl ReplyMime {
    /// Render the RFC 5322 message.
    pub fn to_rfc822(&self) -> Result<String, MimeBuildError> {
        if self.to.email.trim().is_empty() {
            return Err(MimeBuildError::MissingRecipient);
        }
        if self.body.trim().is_empty() {
            return Err(MimeBuildError::MissingBody);
        }

        let mut builder = MessageBuilder::new()
            .to(header_address(&self.to))
            .subject(self.subject.as_str())
            .text_body(self.body.as_str());

        if let Some(from) = self.from.as_ref() {
            builder = builder.from(header_address(from));
        }

        match self.in_reply_to.as_deref().and_then(normalize_message_id) {
            Some(parent) => {
                let mut chain = self.references.clone();
                chain.push(parent.clone());
                builder = builder
                    .in_reply_to(MessageId::new(parent))
                    .references(MessageId::from(dedup_message_ids(chain)));
            }
            None if !self.references.is_empty() => {
                builder =
                    builder.references(MessageId::from(dedup_message_ids(self.references.clone())));
            }
            None => {}
        }

        builder.write_to_string().map_err(MimeBuildError::Io)
    }

    /// The `raw` field of a Gmail `messages.send` request.
    pub fn to_base64_url(&self) -> Result<String, MimeBuildError> {
        let raw = self.to_rfc822()?;
        Ok(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
    }
}

#[derive(Debug, Error)]
pub enum MimeBuildError {
    #[error("a recipient is required")]
    MissingRecipient,
    #[error("a body is required")]
    MissingBody,
    #[error("failed to build message: {0}")]
    Io(#[from] std::io::Error),
}

fn header_address(addr: &EmailAddress) -> Address<'static> {
    Address::new_address(addr.name.clone(), addr.email.clone())
}

/// Strip whitespace and angle brackets; `None` when nothing is left.
pub fn normalize_message_id(id: &str) -> Option<String> {
    let trimmed = id.trim().trim_matches('<').trim_matches('>').trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Split a `References` header value into individual ids.
pub fn split_references(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .filter_map(normalize_message_id)
        .collect()
}

fn dedup_message_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(normalized) = normalize_message_id(&id) {
            if !seen.contains(&normalized) {
                seen.push(normalized);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply() -> ReplyMime {
        ReplyMime {
            from: Some(EmailAddress::from("me@example.com")),
            to: EmailAddress::new(Some("Ada Lovelace"), "ada@example.com"),
            subject: "Auto-Reply: Out of Office".to_string(),
            body: "Thank you for your email.".to_string(),
            in_reply_to: None,
            references: Vec::new(),
        }
    }

    #[test]
    fn renders_headers_and_body() {
        let raw = reply().to_rfc822().expect("builds");

        assert!(raw.contains("me@example.com"), "{raw}");
        assert!(raw.contains("Ada Lovelace"), "{raw}");
        assert!(raw.contains("<ada@example.com>"), "{raw}");
        assert!(raw.contains("Subject: Auto-Reply: Out of Office"), "{raw}");
        assert!(raw.contains("Thank you for your email."), "{raw}");
        assert!(!raw.contains("In-Reply-To"), "{raw}");
    }

    #[test]
    fn threads_under_parent_message_id() {
        let mut message = reply();
        message.in_reply_to = Some(" <orig@mail.example.com> ".to_string());
        message.references = vec![
            "<root@mail.example.com>".to_string(),
            "orig@mail.example.com".to_string(),
        ];

        let raw = message.to_rfc822().expect("builds");

        assert!(raw.contains("In-Reply-To: <orig@mail.example.com>"), "{raw}");
        let references = raw
            .lines()
            .find(|line| line.starts_with("References:"))
            .expect("references header");
        assert!(references.contains("<root@mail.example.com>"), "{raw}");
        assert_eq!(raw.matches("<orig@mail.example.com>").count(), 2, "{raw}");
    }

    #[test]
    fn base64_url_output_has_no_padding_or_unsafe_chars() {
        let encoded = reply().to_base64_url().expect("encodes");
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));

        let decoded = URL_SAFE_NO_PAD.decode(encoded).expect("decodes");
        let text = String::from_utf8(decoded).expect("utf8");
        assert!(text.contains("ada@example.com"));
    }

    #[test]
    fn rejects_blank_recipient_and_body() {
        let mut message = reply();
        message.to = EmailAddress::from("  ");
        assert!(matches!(
            message.to_rfc822(),
            Err(MimeBuildError::MissingRecipient)
        ));

        let mut message = reply();
        message.body = String::new();
        assert!(matches!(message.to_rfc822(), Err(MimeBuildError::MissingBody)));
    }

    #[test]
    fn parses_mailbox_forms() {
        assert_eq!(
            EmailAddress::parse("\"Doe, Jane\" <jane@example.com>"),
            Some(EmailAddress::new(Some("Doe, Jane"), "jane@example.com"))
        );
        assert_eq!(
            EmailAddress::parse("Bob <bob@example.com>"),
            Some(EmailAddress::new(Some("Bob"), "bob@example.com"))
        );
        assert_eq!(
            EmailAddress::parse("a@x.com"),
            Some(EmailAddress::from("a@x.com"))
        );
        assert_eq!(
            EmailAddress::parse("<plain@example.com>"),
            Some(EmailAddress::from("plain@example.com"))
        );
        assert_eq!(EmailAddress::parse("Nobody <>"), None);
        assert_eq!(EmailAddress::parse("   "), None);
    }

    #[test]
    fn message_id_helpers() {
        assert_eq!(normalize_message_id("  <abc@y.com> "), Some("abc@y.com".to_string()));
        assert_eq!(normalize_message_id("<>"), None);
        assert_eq!(
            split_references("<a@x> <b@x>\r\n <a@x>"),
            vec!["a@x".to_string(), "b@x".to_string(), "a@x".to_string()]
        );
        assert_eq!(
            dedup_message_ids(split_references("<a@x> <b@x> <a@x>")),
            vec!["a@x".to_string(), "b@x".to_string()]
        );
    }
}
