//! Durable record of auto-replies, consulted before sending so a crash between
//! sending and tagging does not produce a second reply.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;

use crate::db::{Database, DbError};
use crate::migrations::{MigrationError, run_migrations};

const REPLY_COLUMNS: &str =
    "message_id, thread_id, reply_id, state, attempts, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// Recorded before sending; the send outcome is unknown.
    Pending,
    Sent,
    Tagged,
}

impl ReplyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyState::Pending => "pending",
            ReplyState::Sent => "sent",
            ReplyState::Tagged => "tagged",
        }
    }

    fn parse(value: &str) -> Result<Self, LedgerError> {
        match value {
            "pending" => Ok(ReplyState::Pending),
            "sent" => Ok(ReplyState::Sent),
            "tagged" => Ok(ReplyState::Tagged),
            other => Err(LedgerError::InvalidState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRecord {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub reply_id: Option<String>,
    pub state: ReplyState,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of [`ReplyLedger::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// No earlier attempt; a pending record now exists.
    Started,
    Existing(ReplyRecord),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("invalid reply state {0:?}")]
    InvalidState(String),
    #[error("no ledger record for message {0}")]
    NotFound(String),
}

#[async_trait]
pub trait ReplyLedger: Send + Sync {
    /// Record the intent to reply, or return what an earlier attempt left behind.
    async fn begin(&self, message_id: &str, thread_id: Option<&str>)
    -> Result<Begin, LedgerError>;

    /// Count another send attempt for a pending record.
    async fn retry(&self, message_id: &str) -> Result<(), LedgerError>;

    /// Forget a pending record after a send that definitely failed.
    async fn abandon(&self, message_id: &str) -> Result<(), LedgerError>;

    async fn mark_sent(&self, message_id: &str, reply_id: &str) -> Result<(), LedgerError>;

    async fn mark_tagged(&self, message_id: &str) -> Result<(), LedgerError>;

    async fn get(&self, message_id: &str) -> Result<Option<ReplyRecord>, LedgerError>;
}

/// Keeps nothing; every message looks new.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLedger;

#[async_trait]
impl ReplyLedger for NoopLedger {
    async fn begin(
        &self,
        _message_id: &str,
        _thread_id: Option<&str>,
    ) -> Result<Begin, LedgerError> {
        Ok(Begin::Started)
    }

    async fn retry(&self, _message_id: &str) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn abandon(&self, _message_id: &str) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn mark_sent(&self, _message_id: &str, _reply_id: &str) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn mark_tagged(&self, _message_id: &str) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn get(&self, _message_id: &str) -> Result<Option<ReplyRecord>, LedgerError> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct SqliteLedger {
    db: Database,
}

impl SqliteLedger {
    /// Open (or create) the ledger and bring its schema up to date.
    pub async fn open(location: &Path) -> Result<Self, LedgerError> {
        let db = Database::open(location).await?;
        run_migrations(&db).await?;
        Ok(Self { db })
    }

    pub async fn health_check(&self) -> Result<(), LedgerError> {
        Ok(self.db.health_check().await?)
    }

    async fn update(
        &self,
        message_id: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<(), LedgerError> {
        let conn = self.db.connection().await?;
        let changed = conn.execute(sql, params).await?;
        if changed == 0 {
            return Err(LedgerError::NotFound(message_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReplyLedger for SqliteLedger {
    async fn begin(
        &self,
        message_id: &str,
        thread_id: Option<&str>,
    ) -> Result<Begin, LedgerError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let inserted = conn
            .execute(
                "INSERT INTO replies (message_id, thread_id, state, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?3)
                 ON CONFLICT(message_id) DO NOTHING",
                params![message_id, thread_id.map(str::to_string), now],
            )
            .await?;
        if inserted == 1 {
            return Ok(Begin::Started);
        }

        self.get(message_id)
            .await?
            .map(Begin::Existing)
            .ok_or_else(|| LedgerError::NotFound(message_id.to_string()))
    }

    async fn retry(&self, message_id: &str) -> Result<(), LedgerError> {
        self.update(
            message_id,
            "UPDATE replies SET attempts = attempts + 1, updated_at = ?2
             WHERE message_id = ?1 AND state = 'pending'",
            params![message_id, now_rfc3339()],
        )
        .await
    }

    async fn abandon(&self, message_id: &str) -> Result<(), LedgerError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "DELETE FROM replies WHERE message_id = ?1 AND state = 'pending'",
            params![message_id],
        )
        .await?;
        Ok(())
    }

    async fn mark_sent(&self, message_id: &str, reply_id: &str) -> Result<(), LedgerError> {
        self.update(
            message_id,
            "UPDATE replies SET state = 'sent', reply_id = ?2, updated_at = ?3
             WHERE message_id = ?1",
            params![message_id, reply_id, now_rfc3339()],
        )
        .await
    }

    async fn mark_tagged(&self, message_id: &str) -> Result<(), LedgerError> {
        self.update(
            message_id,
            "UPDATE replies SET state = 'tagged', updated_at = ?2 WHERE message_id = ?1",
            params![message_id, now_rfc3339()],
        )
        .await
    }

    async fn get(&self, message_id: &str) -> Result<Option<ReplyRecord>, LedgerError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {REPLY_COLUMNS} FROM replies WHERE message_id = ?1"),
                params![message_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }
}

fn row_to_record(row: Row) -> Result<ReplyRecord, LedgerError> {
    let state: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(ReplyRecord {
        message_id: row.get(0)?,
        thread_id: row.get(1)?,
        reply_id: row.get(2)?,
        state: ReplyState::parse(&state)?,
        attempts: row.get(4)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
