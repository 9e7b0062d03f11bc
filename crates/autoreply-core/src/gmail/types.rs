use serde::{Deserialize, Serialize};

/// Minimal message stub returned by list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageId {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePart {
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
    #[serde(rename = "labelIds", default)]
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListMessagesResponse {
    #[serde(default)]
    pub messages: Vec<MessageId>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    pub result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelColor {
    #[serde(rename = "backgroundColor")]
    pub background_color: Option<String>,
    #[serde(rename = "textColor")]
    pub text_color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Label {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub label_type: Option<String>,
    #[serde(rename = "messageListVisibility")]
    pub message_list_visibility: Option<String>,
    #[serde(rename = "labelListVisibility")]
    pub label_list_visibility: Option<String>,
    pub color: Option<LabelColor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListLabelsResponse {
    #[serde(default)]
    pub labels: Vec<Label>,
}

/// How a label shows up in the Gmail UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelVisibility {
    pub label_list: &'static str,
    pub message_list: &'static str,
}

impl LabelVisibility {
    /// A normal user-visible label: listed in the sidebar and shown on messages.
    pub const SHOW: LabelVisibility = LabelVisibility {
        label_list: "labelShow",
        message_list: "show",
    };
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CreateLabelRequest<'a> {
    pub name: &'a str,
    #[serde(rename = "labelListVisibility")]
    pub label_list_visibility: &'a str,
    #[serde(rename = "messageListVisibility")]
    pub message_list_visibility: &'a str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModifyMessageRequest<'a> {
    #[serde(rename = "addLabelIds", skip_serializing_if = "no_ids")]
    pub add_label_ids: &'a [String],
    #[serde(rename = "removeLabelIds", skip_serializing_if = "no_ids")]
    pub remove_label_ids: &'a [String],
}

fn no_ids(ids: &&[String]) -> bool {
    ids.is_empty()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SendMessageRequest<'a> {
    pub raw: &'a str,
    #[serde(rename = "threadId", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<&'a str>,
}

/// Response body of `messages.send`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "labelIds", default)]
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "messagesTotal")]
    pub messages_total: Option<u64>,
    #[serde(rename = "threadsTotal")]
    pub threads_total: Option<u64>,
    #[serde(rename = "historyId")]
    pub history_id: String,
}
