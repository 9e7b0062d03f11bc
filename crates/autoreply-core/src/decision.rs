use std::fmt;

use crate::mailbox::MailMessage;

pub const IN_REPLY_TO: &str = "In-Reply-To";

/// The label that marks a message as answered. Gmail reports label ids on messages,
/// so once the label has been resolved its id is matched as well as its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelLabel {
    pub name: String,
    pub id: Option<String>,
}

impl SentinelLabel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    fn is_on(&self, message: &MailMessage) -> bool {
        message.label_ids.contains(&self.name)
            || self
                .id
                .as_ref()
                .is_some_and(|id| message.label_ids.contains(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyReplied,
    IsReply,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyReplied => f.write_str("already carries the sentinel label"),
            SkipReason::IsReply => f.write_str("is itself a reply"),
        }
    }
}

/// Why `message` should not be answered, or `None` if it should.
///
/// The `In-Reply-To` check is an exact, case-sensitive header name match.
pub fn skip_reason(message: &MailMessage, sentinel: &SentinelLabel) -> Option<SkipReason> {
    if sentinel.is_on(message) {
        return Some(SkipReason::AlreadyReplied);
    }
    if message.header_exact(IN_REPLY_TO).is_some() {
        return Some(SkipReason::IsReply);
    }
    None
}

pub fn should_auto_reply(message: &MailMessage, sentinel: &SentinelLabel) -> bool {
    skip_reason(message, sentinel).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel() -> SentinelLabel {
        SentinelLabel::new("AutoReplied")
    }

    /// A spread of label sets and header lists to check the predicate against.
    fn corpus() -> Vec<MailMessage> {
        let label_sets: [&[&str]; 5] = [
            &[],
            &["INBOX"],
            &["INBOX", "UNREAD"],
            &["IMPORTANT", "CATEGORY_PERSONAL", "Label_9"],
            &["autoreplied"],
        ];
        let header_sets: [&[(&str, &str)]; 6] = [
            &[],
            &[("From", "a@x.com")],
            &[("From", "a@x.com"), ("Subject", "Hi")],
            &[("in-reply-to", "<lower@y.com>")],
            &[("IN-REPLY-TO", "<upper@y.com>"), ("From", "b@x.com")],
            &[("References", "<r@y.com>"), ("Message-ID", "<m@y.com>")],
        ];

        let mut messages = Vec::new();
        for (i, labels) in label_sets.iter().enumerate() {
            for (j, headers) in header_sets.iter().enumerate() {
                let mut message = MailMessage::new(format!("m-{i}-{j}")).with_thread("t");
                for label in labels.iter() {
                    message = message.with_label(*label);
                }
                for (name, value) in headers.iter() {
                    message = message.with_header(*name, *value);
                }
                messages.push(message);
            }
        }
        messages
    }

    #[test]
    fn sentinel_label_always_prevents_reply() {
        for message in corpus() {
            let tagged = message.with_label("AutoReplied");
            assert!(!should_auto_reply(&tagged, &sentinel()), "{tagged:?}");
            assert_eq!(
                skip_reason(&tagged, &sentinel()),
                Some(SkipReason::AlreadyReplied)
            );
        }
    }

    #[test]
    fn resolved_sentinel_id_prevents_reply() {
        let resolved = sentinel().with_id("Label_42");
        for message in corpus() {
            let tagged = message.with_label("Label_42");
            assert!(!should_auto_reply(&tagged, &resolved), "{tagged:?}");
        }
        // The id alone means nothing until it has been resolved.
        let message = MailMessage::new("m").with_label("Label_42");
        assert!(should_auto_reply(&message, &sentinel()));
    }

    #[test]
    fn in_reply_to_header_always_prevents_reply() {
        for message in corpus() {
            let reply = message.with_header("In-Reply-To", "<abc@y.com>");
            assert!(!should_auto_reply(&reply, &sentinel()), "{reply:?}");
        }
    }

    #[test]
    fn everything_else_gets_a_reply() {
        for message in corpus() {
            assert!(should_auto_reply(&message, &sentinel()), "{message:?}");
        }
    }

    #[test]
    fn header_name_match_is_case_sensitive() {
        let lower = MailMessage::new("m").with_header("in-reply-to", "<abc@y.com>");
        assert!(should_auto_reply(&lower, &sentinel()));
    }

    #[test]
    fn predicate_is_pure() {
        for message in corpus() {
            let before = message.clone();
            let first = should_auto_reply(&message, &sentinel());
            let second = should_auto_reply(&message, &sentinel());
            assert_eq!(first, second);
            assert_eq!(message, before);
        }
    }

    #[test]
    fn empty_message_is_answered() {
        assert!(should_auto_reply(&MailMessage::new("bare"), &sentinel()));
    }

    #[test]
    fn scenario_plain_message_is_answered() {
        let message = MailMessage::new("a")
            .with_header("From", "a@x.com")
            .with_header("Subject", "Hi");
        assert!(should_auto_reply(&message, &sentinel()));
    }

    #[test]
    fn scenario_tagged_message_is_skipped() {
        let message = MailMessage::new("b").with_label("AutoReplied");
        assert!(!should_auto_reply(&message, &sentinel()));
    }

    #[test]
    fn scenario_reply_is_skipped() {
        let message = MailMessage::new("c").with_header("In-Reply-To", "<abc@y.com>");
        assert_eq!(skip_reason(&message, &sentinel()), Some(SkipReason::IsReply));
    }
}
