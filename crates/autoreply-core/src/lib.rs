pub mod config;
pub mod db;
pub mod decision;
pub mod gmail;
pub mod labels;
pub mod ledger;
pub mod mailbox;
pub mod migrations;
pub mod telemetry;
pub mod worker;

pub use config::Config;
pub use db::Database;
pub use decision::{SentinelLabel, SkipReason, should_auto_reply, skip_reason};
pub use labels::LabelResolver;
pub use ledger::{NoopLedger, ReplyLedger, ReplyRecord, ReplyState, SqliteLedger};
pub use mailbox::{GmailMailbox, InboxQuery, MailMessage, Mailbox, MailboxError, OutgoingReply};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
pub use worker::{
    AutoReplyWorker, CycleReport, CycleStatus, MessageOutcome, WorkerConfig, WorkerError,
    run_worker,
};
