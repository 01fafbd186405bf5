mod pidfile;

use std::sync::Arc;
use std::time::Duration;

use capa_executor::Executor;
use capa_oauth::OAuthManager;
use capa_proxy::Proxy;
use capa_router::RouterState;
use capa_session::SessionManager;
use capa_shared::config::BrokerConfig;
use capa_shared::error::CommonError;
use capa_shared::subsystem::{install_shutdown_signal_handler, spawn_subsystem};
use capa_store::connection::establish_db_connection;
use capa_store::repository::{
    OAuth2TokenRepositoryLike, ProjectRepositoryLike, Repository,
};
use capa_supervisor::Supervisor;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Refresh window: tokens expiring within 10 minutes are proactively refreshed.
const TOKEN_REFRESH_WINDOW_SECONDS: i64 = 600;
const SCHEDULER_TICK: Duration = Duration::from_secs(60);
const SESSION_SWEEP_TICK: Duration = Duration::from_secs(60);
/// Idle timeout: sessions untouched for 60 minutes are pruned.
const SESSION_IDLE_MINUTES: i64 = 60;

/// Local MCP broker daemon: supervises project tool servers and exposes one JSON-RPC
/// endpoint per project. The install/clean/add CLI front-end is out of scope
/// — this binary only ever serves.
#[derive(Parser)]
#[command(name = "capa", version)]
struct Cli {
    /// Bind host, overriding $HOST and the 127.0.0.1 default.
    #[arg(long)]
    host: Option<String>,
    /// Bind port, overriding $PORT and the 5912 default.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    human_panic::setup_panic!();
    capa_shared::env::configure_env()?;
    capa_shared::logging::configure_logging()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = BrokerConfig::resolve(cli.host, cli.port)?;

    pidfile::check_not_already_running(&config.pid_file)?;

    let (_db, conn) = establish_db_connection(&config.db_path).await?;
    let store = Arc::new(Repository::new(conn));

    let supervisor = Arc::new(Supervisor::new(store.clone()));
    supervisor.prune_orphans_on_startup().await?;

    let oauth = Arc::new(OAuthManager::new(store.clone()));
    let proxy = Arc::new(Proxy::new(store.clone(), supervisor.clone(), oauth.clone()));
    let sessions = Arc::new(SessionManager::new(store.clone()));
    let executor = Arc::new(Executor::new(store.clone()));

    let base_url = format!("http://{}:{}", config.host, config.port);
    // No HTML admin UI ships in this core (Non-goals); a project embedding one
    // can still point the OAuth2 callback redirect there via this override.
    let ui_redirect_base = std::env::var("CAPA_UI_BASE_URL").unwrap_or_else(|_| base_url.clone());

    let state = Arc::new(RouterState::new(
            store.clone(),
            sessions.clone(),
            proxy.clone(),
            supervisor.clone(),
            oauth.clone(),
            executor.clone(),
            ui_redirect_base,
            base_url,
            config.data_dir.clone(),
    ));

    let router = capa_router::build_router(state)?;
    let socket_addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    info!(addr = %socket_addr, "capa listening");

    pidfile::write(&config.pid_file, env!("CARGO_PKG_VERSION"))?;

    let shutdown_tx = install_shutdown_signal_handler();

    let scheduler = spawn_subsystem(
        "oauth-token-refresh-scheduler",
        shutdown_tx.subscribe(),
        run_token_refresh_scheduler(oauth, store.clone(), shutdown_tx.subscribe()),
    );
    let sweeper = spawn_subsystem(
        "session-expiry-sweeper",
        shutdown_tx.subscribe(),
        run_session_sweeper(sessions, shutdown_tx.subscribe()),
    );

    let mut server_shutdown = shutdown_tx.subscribe();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.recv().await;
    })
        .await?;

    info!("http server stopped, shutting down subsystems");
    scheduler.wait_for_shutdown().await;
    sweeper.wait_for_shutdown().await;

    // The proxy's cached stdio transports hold the only references to child stdin/
    // stdout besides the supervisor itself; dropping it here before `stop_all` below
    // is cosmetic (the supervisor terminates the processes either way) but avoids a
    // broken-pipe write racing the SIGTERM.
    drop(proxy);

    if let Err(e) = supervisor.stop_all().await {
        warn!(error = %e, "error stopping supervised subprocesses during shutdown");
    }

    drop(store);
    pidfile::remove(&config.pid_file);
    info!("capa shut down cleanly");
    Ok(())
}

/// Ticks the OAuth2 token-refresh scan every 60s until `shutdown` fires,
/// mirroring the forced-scan logic behind `POST /api/token-refresh/check`.
async fn run_token_refresh_scheduler(
    oauth: Arc<OAuthManager<Repository>>,
    store: Arc<Repository>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), CommonError> {
    let mut ticker = tokio::time::interval(SCHEDULER_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => return Ok(()),
        }

        let candidates = match store.list_tokens_expiring_within(TOKEN_REFRESH_WINDOW_SECONDS).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "oauth2 token refresh scan failed to list candidates");
                continue;
            }
        };

        let checked = candidates.len();
        let mut refreshed = 0u32;
        let mut failed = 0u32;

        for token in candidates {
            let project = match store.get_project(&token.project_id).await {
                Ok(project) => project,
                Err(_) => {
                    failed += 1;
                    continue;
                }
            };
            let token_endpoint = project
                .and_then(|p| p.capabilities)
                .and_then(|c| c.server(&token.server_id).and_then(|s| s.def.oauth2.clone()))
                .map(|oauth2| oauth2.token_endpoint);

            let Some(token_endpoint) = token_endpoint else {
                failed += 1;
                continue;
            };

            match oauth
                .refresh_access_token(&token.project_id, &token.server_id, &token_endpoint)
                .await
            {
                Ok(true) => refreshed += 1,
                Ok(false) | Err(_) => failed += 1,
            }
        }

        if checked > 0 {
            info!(checked, refreshed, failed, "oauth2 token refresh scan complete");
        }
    }
}

/// Ticks the session-expiry sweep every 60s until `shutdown` fires.
async fn run_session_sweeper(
    sessions: Arc<SessionManager<Repository>>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), CommonError> {
    let mut ticker = tokio::time::interval(SESSION_SWEEP_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => return Ok(()),
        }

        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(SESSION_IDLE_MINUTES);
        match sessions.sweep_idle(cutoff).await {
            Ok(removed) if removed > 0 => info!(removed, "swept idle sessions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "session expiry sweep failed"),
        }
    }
}
