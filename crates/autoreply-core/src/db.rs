use std::{env, path::Path, sync::Arc};

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;

/// Handle to the ledger database: a local SQLite file or a remote libsql server.
#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
    remote: bool,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to build database: {0}")]
    Build(libsql::Error),
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
    #[error("missing required LIBSQL_AUTH_TOKEN for remote database")]
    MissingAuthToken,
    #[error("failed to create database directory: {0}")]
    CreateDir(std::io::Error),
}

impl Database {
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        let location = path.to_string_lossy();
        let remote = is_remote(&location);
        let inner = if remote {
            let auth_token = env::var("LIBSQL_AUTH_TOKEN")
                .ok()
                .filter(|token| !token.is_empty())
                .ok_or(DbError::MissingAuthToken)?;

            Builder::new_remote(location.to_string(), auth_token)
                .build()
                .await
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(DbError::CreateDir)?;
            }
            Builder::new_local(location.to_string()).build().await
        }
        .map_err(DbError::Build)?;

        Ok(Self {
            inner: Arc::new(inner),
            remote,
        })
    }

    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        if !self.remote {
            // Instances sharing a ledger file wait on each other's writes.
            let mut rows = conn
                .query("PRAGMA busy_timeout = 5000", ())
                .await
                .map_err(DbError::Statement)?;
            let _ = rows.next().await.map_err(DbError::Statement)?;
        }
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        let _ = rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}

fn is_remote(location: &str) -> bool {
    ["libsql://", "http://", "https://"]
        .iter()
        .any(|scheme| location.starts_with(scheme))
}
