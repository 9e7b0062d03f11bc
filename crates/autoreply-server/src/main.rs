use std::{env, net::SocketAddr, sync::Arc};

use autoreply_core::gmail::{AuthorizedUser, ClientSecrets, FileTokenStore, GmailClient};
use autoreply_core::{
    AutoReplyWorker, Config, CycleStatus, GmailMailbox, Mailbox, NoopLedger, ReplyLedger,
    SqliteLedger, WorkerConfig, init_telemetry,
};
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    status: watch::Receiver<CycleStatus>,
    ledger: Option<Arc<SqliteLedger>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let mailbox = Arc::new(connect_gmail(&config).await?);
    let sqlite_ledger = match &config.paths.ledger {
        Some(path) => {
            info!(path = %path.display(), "using reply ledger");
            Some(Arc::new(SqliteLedger::open(path).await?))
        }
        None => {
            warn!("no ledger configured; a crash between send and tag can repeat a reply");
            None
        }
    };
    let ledger: Arc<dyn ReplyLedger> = match &sqlite_ledger {
        Some(ledger) => ledger.clone(),
        None => Arc::new(NoopLedger),
    };

    let worker = AutoReplyWorker::new(mailbox.clone(), config.reply.clone())
        .with_inbox(&config.gmail)
        .with_ledger(ledger)
        .with_max_messages(config.worker.max_messages_per_cycle);

    // Fail fast on a dead credential before serving.
    let labels = mailbox.list_labels().await.map_err(|err| {
        error!(error = %err, "Gmail rejected the stored credentials; run gmail-oauth again");
        err
    })?;
    info!(count = labels.len(), "fetched Gmail labels");
    worker.labels().prime(&labels);

    let (status_tx, status_rx) = watch::channel(CycleStatus::default());
    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.child_token();
    let worker_handle = tokio::spawn(autoreply_core::run_worker(
        Arc::new(worker),
        WorkerConfig::from(&config.worker),
        worker_shutdown,
        status_tx,
    ));

    let app = router(AppState {
        status: status_rx,
        ledger: sqlite_ledger,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("auto-reply service listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    match worker_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "auto-reply worker exited with error"),
        Err(err) => error!(error = %err, "auto-reply worker task failed"),
    }
    Ok(())
}

async fn connect_gmail(
    config: &Config,
) -> Result<GmailMailbox<FileTokenStore>, Box<dyn std::error::Error>> {
    let secrets = ClientSecrets::load(&config.paths.credentials).await?;
    let user = AuthorizedUser::load(&config.paths.token).await.map_err(|err| {
        error!(
            path = %config.paths.token.display(),
            error = %err,
            "no usable token file; run gmail-oauth to authorize"
        );
        err
    })?;

    let app = secrets.oauth_app();
    let store = Arc::new(FileTokenStore::new(&config.paths.token, app.clone()));
    let mut client = GmailClient::new(
        reqwest::Client::new(),
        config.gmail.user_id.clone(),
        app,
        user.tokens(),
        store,
    );
    if let Some(base) = &config.gmail.api_base {
        client = client.with_api_base(base.clone());
    }
    Ok(GmailMailbox::new(client))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    ledger: String,
    worker: CycleStatus,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let worker = state.status.borrow().clone();
    let ledger_status = match &state.ledger {
        Some(ledger) => match ledger.health_check().await {
            Ok(()) => "ok",
            Err(_) => "unhealthy",
        },
        None => "disabled",
    };

    let healthy = !worker.stopped && ledger_status != "unhealthy";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ledger: ledger_status.to_string(),
            worker,
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
    }

    shutdown.cancel();
}
