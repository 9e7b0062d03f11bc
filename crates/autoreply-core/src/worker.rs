use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{GmailConfig, ReplyConfig, WorkerSettings};
use crate::decision::{SentinelLabel, SkipReason, skip_reason};
use crate::gmail::mime_builder::split_references;
use crate::labels::LabelResolver;
use crate::ledger::{Begin, LedgerError, NoopLedger, ReplyLedger, ReplyState};
use crate::mailbox::{InboxQuery, MailMessage, Mailbox, MailboxError, OutgoingReply};

const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub cycle_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig::from(&WorkerSettings::default())
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            cycle_timeout: settings.cycle_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("authorization failed: {0}; run gmail-oauth to authorize again")]
    Auth(MailboxError),
    #[error("failed to fetch {what}: {source}")]
    Fetch {
        what: String,
        #[source]
        source: MailboxError,
    },
    #[error("message {message_id} has no usable {header} header")]
    MissingHeader {
        message_id: String,
        header: &'static str,
    },
    #[error("failed to send reply to {message_id}: {source}")]
    Send {
        message_id: String,
        #[source]
        source: MailboxError,
    },
    #[error("failed to tag {message_id} with {label}: {source}")]
    Tag {
        message_id: String,
        label: String,
        #[source]
        source: MailboxError,
    },
    #[error("reply ledger failed for {message_id}: {source}")]
    Ledger {
        message_id: String,
        #[source]
        source: LedgerError,
    },
}

impl WorkerError {
    /// Errors that no later cycle can recover from without the user.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::Auth(_))
    }

    fn fetch(what: impl Into<String>, source: MailboxError) -> Self {
        match source {
            MailboxError::Unauthorized => WorkerError::Auth(source),
            source => WorkerError::Fetch {
                what: what.into(),
                source,
            },
        }
    }

    fn send(message_id: &str, source: MailboxError) -> Self {
        match source {
            MailboxError::Unauthorized => WorkerError::Auth(source),
            source => WorkerError::Send {
                message_id: message_id.to_string(),
                source,
            },
        }
    }

    fn tag(message_id: &str, label: &str, source: MailboxError) -> Self {
        match source {
            MailboxError::Unauthorized => WorkerError::Auth(source),
            source => WorkerError::Tag {
                message_id: message_id.to_string(),
                label: label.to_string(),
                source,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Skipped(SkipReason),
    Replied { reply_id: String },
    /// The reply went out but the sentinel label could not be applied everywhere.
    RepliedTagFailed { reply_id: String },
    /// An earlier attempt already replied, or may have. `reply_id` is known only if
    /// that attempt got as far as recording it.
    AlreadyReplied { reply_id: Option<String> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub seen: usize,
    pub replied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Latest state of the poll loop, published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStatus {
    pub cycles: u64,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
    pub error: Option<String>,
    /// The loop exited on an error that needs the user (expired authorization).
    pub stopped: bool,
}

/// Polls the inbox and answers each new message once with a fixed reply.
pub struct AutoReplyWorker<M: Mailbox> {
    mailbox: Arc<M>,
    ledger: Arc<dyn ReplyLedger>,
    labels: LabelResolver,
    reply: ReplyConfig,
    inbox: InboxQuery,
    max_messages: usize,
}

impl<M: Mailbox> AutoReplyWorker<M> {
    pub fn new(mailbox: Arc<M>, reply: ReplyConfig) -> Self {
        let gmail = GmailConfig::default();
        Self {
            mailbox,
            ledger: Arc::new(NoopLedger),
            labels: LabelResolver::default(),
            reply,
            inbox: InboxQuery {
                query: gmail.query,
                label_ids: gmail.label_ids,
                page_size: Some(PAGE_SIZE),
            },
            max_messages: WorkerSettings::default().max_messages_per_cycle,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn ReplyLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_inbox(mut self, gmail: &GmailConfig) -> Self {
        self.inbox.query = gmail.query.clone();
        self.inbox.label_ids = gmail.label_ids.clone();
        self
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages.max(1);
        let limit = u32::try_from(self.max_messages).unwrap_or(u32::MAX);
        self.inbox.page_size = Some(PAGE_SIZE.min(limit));
        self
    }

    pub fn labels(&self) -> &LabelResolver {
        &self.labels
    }

    /// The sentinel with its label id once it has been resolved.
    pub fn sentinel(&self) -> SentinelLabel {
        let sentinel = SentinelLabel::new(&self.reply.sentinel_label);
        match self.labels.cached(&self.reply.sentinel_label) {
            Some(id) => sentinel.with_id(id),
            None => sentinel,
        }
    }

    /// One cycle over the current inbox snapshot. Per-message failures are counted
    /// and logged; only listing failures and rejected credentials end the cycle early.
    #[instrument(name = "AutoReplyWorker::poll_inbox", skip(self))]
    pub async fn poll_inbox(&self) -> Result<CycleReport, WorkerError> {
        let mut report = CycleReport::default();
        let mut processed = HashSet::new();
        let mut page_token: Option<String> = None;

        'pages: loop {
            let page = self
                .mailbox
                .list_message_ids(&self.inbox, page_token.as_deref())
                .await
                .map_err(|err| WorkerError::fetch("inbox listing", err))?;

            for id in page.ids {
                if processed.len() >= self.max_messages {
                    debug!(limit = self.max_messages, "message limit reached for this cycle");
                    break 'pages;
                }
                // Pages can shift while new mail arrives.
                if !processed.insert(id.clone()) {
                    continue;
                }
                report.seen += 1;

                let result = AssertUnwindSafe(self.process_message(&id))
                    .catch_unwind()
                    .await;
                match result {
                    Ok(Ok(MessageOutcome::Skipped(reason))) => {
                        debug!(message_id = %id, %reason, "no auto-reply");
                        report.skipped += 1;
                    }
                    Ok(Ok(MessageOutcome::AlreadyReplied { .. })) => report.skipped += 1,
                    Ok(Ok(MessageOutcome::Replied { .. }))
                    | Ok(Ok(MessageOutcome::RepliedTagFailed { .. })) => report.replied += 1,
                    Ok(Err(err)) if err.is_fatal() => return Err(err),
                    Ok(Err(err @ WorkerError::MissingHeader { .. })) => {
                        warn!(message_id = %id, error = %err, "skipping malformed message");
                        report.skipped += 1;
                    }
                    Ok(Err(err)) => {
                        error!(message_id = %id, error = %err, "failed to process message");
                        report.failed += 1;
                    }
                    Err(panic) => {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .map(|msg| msg.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "message processing panic".to_string());
                        error!(message_id = %id, "message processing panicked: {reason}");
                        report.failed += 1;
                    }
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        info!(
            seen = report.seen,
            replied = report.replied,
            skipped = report.skipped,
            failed = report.failed,
            "poll cycle finished"
        );
        Ok(report)
    }

    #[instrument(name = "AutoReplyWorker::process_message", skip(self))]
    pub async fn process_message(&self, message_id: &str) -> Result<MessageOutcome, WorkerError> {
        let message = self
            .mailbox
            .get_message(message_id)
            .await
            .map_err(|err| WorkerError::fetch(format!("message {message_id}"), err))?;

        if let Some(reason) = skip_reason(&message, &self.sentinel()) {
            return Ok(MessageOutcome::Skipped(reason));
        }
        if self.labels.cached(&self.reply.sentinel_label).is_none() {
            // The label may exist without this process having seen it yet.
            let found = self
                .labels
                .lookup(self.mailbox.as_ref(), &self.reply.sentinel_label)
                .await
                .map_err(|err| WorkerError::fetch("labels", err))?;
            if found.is_some() {
                if let Some(reason) = skip_reason(&message, &self.sentinel()) {
                    return Ok(MessageOutcome::Skipped(reason));
                }
            }
        }

        let reply = self.build_reply(&message)?;

        let begin = self
            .ledger
            .begin(&message.id, message.thread_id.as_deref())
            .await
            .map_err(|source| WorkerError::Ledger {
                message_id: message.id.clone(),
                source,
            })?;

        match begin {
            Begin::Started => {}
            Begin::Existing(record) if record.state == ReplyState::Pending => {
                if !self.reply.resend_unconfirmed {
                    warn!(
                        message_id = %message.id,
                        attempts = record.attempts,
                        "an earlier reply attempt never confirmed; not resending"
                    );
                    return Ok(MessageOutcome::AlreadyReplied { reply_id: None });
                }
                warn!(message_id = %message.id, attempts = record.attempts, "resending unconfirmed reply");
                self.ledger
                    .retry(&message.id)
                    .await
                    .map_err(|source| WorkerError::Ledger {
                        message_id: message.id.clone(),
                        source,
                    })?;
            }
            Begin::Existing(record) => {
                info!(
                    message_id = %message.id,
                    reply_id = record.reply_id.as_deref().unwrap_or_default(),
                    "already replied, restoring sentinel label"
                );
                let tagged = self
                    .tag_reply_pair(&message.id, record.reply_id.as_deref())
                    .await;
                if tagged {
                    self.complete_record(&message.id).await;
                }
                return Ok(MessageOutcome::AlreadyReplied {
                    reply_id: record.reply_id,
                });
            }
        }

        let reply_id = match self.mailbox.send_message(&reply).await {
            Ok(sent) => sent.id,
            Err(err) => {
                if let Err(ledger_err) = self.ledger.abandon(&message.id).await {
                    warn!(message_id = %message.id, error = %ledger_err, "failed to clear pending ledger record");
                }
                return Err(WorkerError::send(&message.id, err));
            }
        };
        info!(message_id = %message.id, reply_id = %reply_id, to = %reply.to, "sent auto-reply");

        if let Err(err) = self.ledger.mark_sent(&message.id, &reply_id).await {
            warn!(message_id = %message.id, error = %err, "failed to record sent reply");
        }

        if self.tag_reply_pair(&message.id, Some(&reply_id)).await {
            self.complete_record(&message.id).await;
            Ok(MessageOutcome::Replied { reply_id })
        } else {
            Ok(MessageOutcome::RepliedTagFailed { reply_id })
        }
    }

    /// Send the configured reply to the sender of `message`, on its thread. Returns
    /// the id of the sent message.
    pub async fn send_auto_reply(&self, message: &MailMessage) -> Result<String, WorkerError> {
        let reply = self.build_reply(message)?;
        let sent = self
            .mailbox
            .send_message(&reply)
            .await
            .map_err(|err| WorkerError::send(&message.id, err))?;
        Ok(sent.id)
    }

    /// Apply `label_name` to a message, creating the label on first use. Returns the
    /// label id.
    pub async fn tag_message(
        &self,
        message_id: &str,
        label_name: &str,
    ) -> Result<String, WorkerError> {
        self.labels
            .apply(self.mailbox.as_ref(), message_id, label_name)
            .await
            .map_err(|err| WorkerError::tag(message_id, label_name, err))
    }

    fn build_reply(&self, message: &MailMessage) -> Result<OutgoingReply, WorkerError> {
        let to = message
            .header("From")
            .map(str::trim)
            .filter(|from| !from.is_empty())
            .ok_or_else(|| WorkerError::MissingHeader {
                message_id: message.id.clone(),
                header: "From",
            })?;

        let in_reply_to = message
            .header("Message-ID")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let mut references = message
            .header("References")
            .map(split_references)
            .unwrap_or_default();
        if references.is_empty() {
            if let Some(parent) = &in_reply_to {
                references = split_references(parent);
            }
        }

        Ok(OutgoingReply {
            thread_id: message.thread_id.clone(),
            to: to.to_string(),
            subject: self.reply.subject.clone(),
            body: self.reply.body.clone(),
            in_reply_to,
            references,
        })
    }

    /// Tag the sent reply and the original message with the sentinel label. The
    /// original carries the marker the next cycle checks. Returns whether both
    /// succeeded.
    async fn tag_reply_pair(&self, message_id: &str, reply_id: Option<&str>) -> bool {
        let label = self.reply.sentinel_label.as_str();
        let mut ok = true;
        for target in reply_id.into_iter().chain(std::iter::once(message_id)) {
            if let Err(err) = self.tag_message(target, label).await {
                warn!(message_id = %message_id, target = %target, error = %err, "failed to apply sentinel label");
                ok = false;
            }
        }
        ok
    }

    async fn complete_record(&self, message_id: &str) {
        if let Err(err) = self.ledger.mark_tagged(message_id).await {
            warn!(message_id = %message_id, error = %err, "failed to record tagging");
        }
    }
}

/// Run poll cycles until cancelled. Cycles never overlap and each is bounded by
/// `cycle_timeout`. Returns the error that stopped the loop, if any.
pub async fn run_worker<M: Mailbox>(
    worker: Arc<AutoReplyWorker<M>>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    status: watch::Sender<CycleStatus>,
) -> Result<(), WorkerError> {
    info!(
        poll_interval_secs = config.poll_interval.as_secs(),
        cycle_timeout_secs = config.cycle_timeout.as_secs(),
        "auto-reply worker started"
    );

    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = timeout(config.cycle_timeout, worker.poll_inbox()) => result,
        };

        let now = Utc::now();
        match result {
            Ok(Ok(report)) => status.send_modify(|status| {
                status.cycles += 1;
                status.finished_at = Some(now);
                status.last_report = Some(report);
                status.error = None;
            }),
            Ok(Err(err)) if err.is_fatal() => {
                error!(error = %err, "stopping auto-reply worker");
                status.send_modify(|status| {
                    status.cycles += 1;
                    status.finished_at = Some(now);
                    status.error = Some(err.to_string());
                    status.stopped = true;
                });
                return Err(err);
            }
            Ok(Err(err)) => {
                warn!(error = %err, "poll cycle aborted; retrying next interval");
                status.send_modify(|status| {
                    status.cycles += 1;
                    status.finished_at = Some(now);
                    status.error = Some(err.to_string());
                });
            }
            Err(_) => {
                warn!(
                    timeout_secs = config.cycle_timeout.as_secs(),
                    "poll cycle timed out"
                );
                status.send_modify(|status| {
                    status.cycles += 1;
                    status.finished_at = Some(now);
                    status.error = Some("poll cycle timed out".to_string());
                });
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(config.poll_interval) => {}
        }
    }

    info!("auto-reply worker stopped");
    Ok(())
}
