use std::sync::Arc;

use capa_shared::error::CommonError;
use capa_store::repository::{ProjectRepositoryLike, SessionRepositoryLike};
use tracing::info;

const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
/// Idle timeout: sessions untouched for 60 minutes are pruned.
const IDLE_TIMEOUT_MINUTES: i64 = 60;

/// Runs the session-expiry sweep every 60s until the process shuts down.
/// Expiration is never surfaced to the client: the next request against a pruned id
/// simply creates a fresh session via `initialize`.
pub async fn run_expiry_sweeper<R>(manager: Arc<crate::SessionManager<R>>) -> Result<(), CommonError>
where
    R: SessionRepositoryLike + ProjectRepositoryLike + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        ticker.tick().await;
        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(IDLE_TIMEOUT_MINUTES);
        match manager.sweep_idle(cutoff).await {
            Ok(removed) if removed > 0 => info!(removed, "swept idle sessions"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "session expiry sweep failed"),
        }
    }
}
