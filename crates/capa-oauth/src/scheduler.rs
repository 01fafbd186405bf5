use std::sync::Arc;

use capa_shared::error::CommonError;
use capa_store::repository::OAuth2TokenRepositoryLike;
use tracing::info;

use crate::flow::OAuthManager;

const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
/// Refresh window: tokens expiring within 10 minutes are proactively refreshed.
const REFRESH_WINDOW_SECONDS: i64 = 600;

/// One tick of the token refresh scheduler: scans every `(project, server)` row
/// with both a refresh token and an expiry, refreshing any that expire soon.
///
/// Git-provider token refresh could share this loop and the same
/// `refresh_access_token` primitive, but no Git-provider token table exists here
/// (plugin-manifest fetching from Git hosts is out of scope) — see DESIGN.md.
pub async fn run_scheduler_tick<R>(
    manager: &OAuthManager<R>,
    store: &R,
    token_endpoint_for: impl Fn(&str, &str) -> Option<String>,
) -> Result<(), CommonError>
where
    R: OAuth2TokenRepositoryLike + Send + Sync + 'static,
{
    let candidates = store
        .list_tokens_expiring_within(REFRESH_WINDOW_SECONDS)
        .await?;

    let checked = candidates.len();
    let mut refreshed = 0u32;
    let mut failed = 0u32;

    for token in candidates {
        let Some(token_endpoint) = token_endpoint_for(&token.project_id, &token.server_id) else {
            continue;
        };
        match manager
            .refresh_access_token(&token.project_id, &token.server_id, &token_endpoint)
            .await
        {
            Ok(true) => refreshed += 1,
            Ok(false) => failed += 1,
            Err(_) => failed += 1,
        }
    }

    if checked > 0 {
        info!(checked, refreshed, failed, "oauth2 token refresh scan complete");
    }

    Ok(())
}

/// Runs [`run_scheduler_tick`] every 60s until the process shuts down.
pub async fn run_scheduler_loop<R>(
    manager: Arc<OAuthManager<R>>,
    store: Arc<R>,
    token_endpoint_for: impl Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
) -> Result<(), CommonError>
where
    R: OAuth2TokenRepositoryLike + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = run_scheduler_tick(&manager, &store, &token_endpoint_for).await {
            tracing::warn!(error = %e, "oauth2 token refresh tick failed");
        }
    }
}
