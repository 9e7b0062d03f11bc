use serde::Deserialize;
use std::time::Duration;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

pub const DEFAULT_SENTINEL_LABEL: &str = "AutoReplied";
pub const DEFAULT_REPLY_SUBJECT: &str = "Auto-Reply: Out of Office";
pub const DEFAULT_REPLY_BODY: &str = "Thank you for your email. I am currently out of the office and will respond to your message as soon as possible.";
pub const DEFAULT_INBOX_QUERY: &str = "is:unread";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    /// Google client secrets file (`installed` or `web` application).
    pub credentials: PathBuf,
    /// Authorized-user token file written by `gmail-oauth`.
    pub token: PathBuf,
    /// Reply ledger database. Without it, replies are not tracked across restarts.
    #[serde(default)]
    pub ledger: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub export_traces: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct GmailConfig {
    pub user_id: String,
    pub api_base: Option<String>,
    pub query: String,
    pub label_ids: Vec<String>,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            user_id: "me".to_string(),
            api_base: None,
            query: DEFAULT_INBOX_QUERY.to_string(),
            label_ids: vec!["INBOX".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ReplyConfig {
    pub subject: String,
    pub body: String,
    pub sentinel_label: String,
    /// Send again when the ledger shows a reply that was started but never confirmed.
    pub resend_unconfirmed: bool,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            subject: DEFAULT_REPLY_SUBJECT.to_string(),
            body: DEFAULT_REPLY_BODY.to_string(),
            sentinel_label: DEFAULT_SENTINEL_LABEL.to_string(),
            resend_unconfirmed: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct WorkerSettings {
    pub poll_interval_secs: u64,
    pub cycle_timeout_secs: u64,
    pub max_messages_per_cycle: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            cycle_timeout_secs: 120,
            max_messages_per_cycle: 100,
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs.max(1))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
    #[error("invalid POLL_INTERVAL_SECS override: {0}")]
    InvalidPollInterval(std::num::ParseIntError),
    #[error("reply.{0} must not be empty")]
    EmptyReplyField(&'static str),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            self.app.port = port.parse().map_err(ConfigError::InvalidPort)?;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Ok(interval) = env::var("POLL_INTERVAL_SECS") {
            self.worker.poll_interval_secs = interval
                .parse()
                .map_err(ConfigError::InvalidPollInterval)?;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.gmail.user_id)?;
        if let Some(base) = &mut self.gmail.api_base {
            apply_env_marker(base)?;
        }
        apply_env_marker(&mut self.reply.subject)?;
        apply_env_marker(&mut self.reply.body)?;
        apply_env_marker_path(&mut self.paths.credentials)?;
        apply_env_marker_path(&mut self.paths.token)?;
        if let Some(ledger) = &mut self.paths.ledger {
            apply_env_marker_path(ledger)?;
        }
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        expand_tilde(&mut self.paths.credentials);
        expand_tilde(&mut self.paths.token);
        if let Some(ledger) = &mut self.paths.ledger {
            expand_tilde(ledger);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reply.sentinel_label.trim().is_empty() {
            return Err(ConfigError::EmptyReplyField("sentinel_label"));
        }
        if self.reply.body.trim().is_empty() {
            return Err(ConfigError::EmptyReplyField("body"));
        }
        Ok(())
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}

fn expand_tilde(path: &mut PathBuf) {
    let raw = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&raw);
    *path = PathBuf::from(expanded.as_ref());
}
