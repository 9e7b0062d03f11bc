use std::path::Path;
use std::sync::Arc;

use autoreply_core::config::ReplyConfig;
use autoreply_core::gmail::{AuthorizedUser, FileTokenStore, GmailClient, OAuthApp, OAuthTokens};
use autoreply_core::{AutoReplyWorker, GmailMailbox, Mailbox, WorkerError};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const USERS: &str = "/gmail/v1/users/me";

async fn mailbox(server: &MockServer, token_path: &Path) -> GmailMailbox<FileTokenStore> {
    let app = OAuthApp::new("client", "secret")
        .with_token_endpoint(format!("{}/token", server.uri()));
    let expired = OAuthTokens {
        access_token: "stale-access".into(),
        refresh_token: "refresh".into(),
        expires_at: Utc::now() - ChronoDuration::minutes(1),
    };
    AuthorizedUser::new(&app, &expired)
        .save(token_path)
        .await
        .expect("seed token file");

    let user = AuthorizedUser::load(token_path).await.expect("load token file");
    let store = Arc::new(FileTokenStore::new(token_path, app.clone()));
    let client = GmailClient::new(reqwest::Client::new(), "me", app, user.tokens(), store)
        .with_api_base(format!("{}/gmail/v1/users", server.uri()));
    GmailMailbox::new(client)
}

async fn mount_token_refresh(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-access",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_inbox(server: &MockServer, ids: &[&str]) {
    let messages: Vec<Value> = ids
        .iter()
        .map(|id| json!({"id": id, "threadId": format!("t-{id}")}))
        .collect();
    Mock::given(method("GET"))
        .and(path(format!("{USERS}/messages")))
        .and(query_param("q", "is:unread"))
        .and(query_param("labelIds", "INBOX"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": messages,
            "resultSizeEstimate": ids.len()
        })))
        .mount(server)
        .await;
}

async fn mount_message(server: &MockServer, id: &str, labels: &[&str], headers: Value) {
    Mock::given(method("GET"))
        .and(path(format!("{USERS}/messages/{id}")))
        .and(query_param("format", "metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": id,
            "threadId": format!("t-{id}"),
            "labelIds": labels,
            "payload": {"mimeType": "text/plain", "headers": headers}
        })))
        .mount(server)
        .await;
}

async fn mount_profile(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("{USERS}/profile")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "emailAddress": "me@example.com",
            "messagesTotal": 10,
            "threadsTotal": 5,
            "historyId": "1"
        })))
        .mount(server)
        .await;
}

async fn mount_send(server: &MockServer, reply_id: &str, thread_id: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path(format!("{USERS}/messages/send")))
        .and(body_partial_json(json!({"threadId": thread_id})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": reply_id,
            "threadId": thread_id,
            "labelIds": ["SENT"]
        })))
        .expect(times)
        .mount(server)
        .await;
}

async fn mount_modify(server: &MockServer, id: &str, label_id: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path(format!("{USERS}/messages/{id}/modify")))
        .and(body_partial_json(json!({"addLabelIds": [label_id]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": id,
            "labelIds": [label_id]
        })))
        .expect(times)
        .mount(server)
        .await;
}

fn decoded_raw(request: &Request) -> String {
    let body: Value = serde_json::from_slice(&request.body).expect("json body");
    let raw = body["raw"].as_str().expect("raw field");
    String::from_utf8(URL_SAFE_NO_PAD.decode(raw).expect("base64url")).expect("utf8")
}

#[tokio::test]
async fn cycle_replies_once_and_skips_tagged_and_replies() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let token_path = dir.path().join("token.json");

    mount_token_refresh(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("{USERS}/labels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "labels": [
                {"id": "INBOX", "name": "INBOX", "type": "system"},
                {"id": "Label_7", "name": "AutoReplied", "type": "user"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_inbox(&server, &["m1", "m2", "m3"]).await;
    mount_message(
        &server,
        "m1",
        &["INBOX", "UNREAD"],
        json!([
            {"name": "From", "value": "Alice <a@x.com>"},
            {"name": "Subject", "value": "Hi"},
            {"name": "Message-ID", "value": "<m1@x.com>"}
        ]),
    )
    .await;
    mount_message(
        &server,
        "m2",
        &["INBOX", "Label_7"],
        json!([{"name": "From", "value": "b@x.com"}]),
    )
    .await;
    mount_message(
        &server,
        "m3",
        &["INBOX"],
        json!([
            {"name": "From", "value": "c@x.com"},
            {"name": "In-Reply-To", "value": "<abc@y.com>"}
        ]),
    )
    .await;
    mount_profile(&server).await;
    mount_send(&server, "r1", "t-m1", 1).await;
    mount_modify(&server, "r1", "Label_7", 1).await;
    mount_modify(&server, "m1", "Label_7", 1).await;
    Mock::given(method("POST"))
        .and(path(format!("{USERS}/labels")))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let mailbox = Arc::new(mailbox(&server, &token_path).await);
    let worker = AutoReplyWorker::new(mailbox.clone(), ReplyConfig::default());
    let labels = mailbox.list_labels().await.expect("labels");
    worker.labels().prime(&labels);

    let report = worker.poll_inbox().await.expect("cycle");

    assert_eq!(report.seen, 3);
    assert_eq!(report.replied, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failed, 0);

    let requests = server.received_requests().await.expect("recording enabled");
    let send = requests
        .iter()
        .find(|r| r.url.path().ends_with("/messages/send"))
        .expect("send request");
    let raw = decoded_raw(send);
    assert!(raw.contains("a@x.com"), "{raw}");
    assert!(raw.contains("me@example.com"), "{raw}");
    assert!(raw.contains("Auto-Reply: Out of Office"), "{raw}");
    assert!(raw.contains("<m1@x.com>"), "{raw}");

    let saved = AuthorizedUser::load(&token_path).await.expect("token file");
    assert_eq!(saved.access_token.as_deref(), Some("fresh-access"));
    assert_eq!(saved.refresh_token, "refresh");
}

#[tokio::test]
async fn sentinel_label_is_created_once_per_cycle() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    mount_token_refresh(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("{USERS}/labels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "labels": [{"id": "INBOX", "name": "INBOX", "type": "system"}]
        })))
        // one lookup before the first reply, one more before creating
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{USERS}/labels")))
        .and(body_partial_json(json!({
            "name": "AutoReplied",
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "Label_9",
            "name": "AutoReplied",
            "type": "user"
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_inbox(&server, &["m1", "m2"]).await;
    for id in ["m1", "m2"] {
        mount_message(
            &server,
            id,
            &["INBOX", "UNREAD"],
            json!([{"name": "From", "value": format!("{id}@x.com")}]),
        )
        .await;
    }
    mount_profile(&server).await;
    mount_send(&server, "r1", "t-m1", 1).await;
    mount_send(&server, "r2", "t-m2", 1).await;
    for id in ["r1", "r2", "m1", "m2"] {
        mount_modify(&server, id, "Label_9", 1).await;
    }

    let mailbox = Arc::new(mailbox(&server, &dir.path().join("token.json")).await);
    let worker = AutoReplyWorker::new(mailbox, ReplyConfig::default());

    let report = worker.poll_inbox().await.expect("cycle");

    assert_eq!(report.replied, 2);
    assert_eq!(worker.labels().cached("AutoReplied").as_deref(), Some("Label_9"));
}

#[tokio::test]
async fn unprimed_worker_skips_message_tagged_by_id() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    mount_token_refresh(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("{USERS}/labels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "labels": [
                {"id": "INBOX", "name": "INBOX", "type": "system"},
                {"id": "Label_7", "name": "AutoReplied", "type": "user"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_inbox(&server, &["m1"]).await;
    mount_message(
        &server,
        "m1",
        &["INBOX", "UNREAD", "Label_7"],
        json!([{"name": "From", "value": "a@x.com"}]),
    )
    .await;
    mount_send(&server, "r1", "t-m1", 0).await;

    let mailbox = Arc::new(mailbox(&server, &dir.path().join("token.json")).await);
    let worker = AutoReplyWorker::new(mailbox, ReplyConfig::default());

    let report = worker.poll_inbox().await.expect("cycle");

    assert_eq!(report.seen, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.replied, 0);
    assert_eq!(worker.labels().cached("AutoReplied").as_deref(), Some("Label_7"));
}

#[tokio::test]
async fn revoked_refresh_token_stops_the_cycle() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{USERS}/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messages": []})))
        .expect(0)
        .mount(&server)
        .await;

    let mailbox = Arc::new(mailbox(&server, &dir.path().join("token.json")).await);
    let worker = AutoReplyWorker::new(mailbox, ReplyConfig::default());

    let err = worker.poll_inbox().await.expect_err("auth fails");

    assert!(matches!(err, WorkerError::Auth(_)), "{err:?}");
    assert!(err.is_fatal());
}
