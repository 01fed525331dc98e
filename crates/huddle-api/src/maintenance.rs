use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use huddle_types::models::User;

use crate::accounts::remove_user;
use crate::error::ApiResult;
use crate::state::AppState;

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub locks_cleared: usize,
    pub warned: Vec<String>,
    pub deleted: Vec<String>,
}

/// Background task that runs the inactivity sweep on an interval. A failed
/// cycle is logged and the next one runs as usual. `shutdown` is only
/// observed between cycles so a sweep in progress always completes.
pub async fn run_maintenance_loop(state: AppState, interval: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Maintenance loop stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        match sweep(&state, Utc::now()).await {
            Ok(report) => {
                if report.locks_cleared > 0 || !report.warned.is_empty() || !report.deleted.is_empty() {
                    info!(
                        "Maintenance: cleared {} lock(s), warned {} user(s), deleted {} user(s)",
                        report.locks_cleared,
                        report.warned.len(),
                        report.deleted.len()
                    );
                }
            }
            Err(e) => {
                warn!("Maintenance error: {}", e);
            }
        }
    }
}

/// One maintenance pass:
/// 1. clear lock markers older than the stale threshold,
/// 2. warn users whose deletion is near and push it back by the warning window,
/// 3. delete warned users whose deadline has passed.
pub async fn sweep(state: &AppState, now: DateTime<Utc>) -> ApiResult<SweepReport> {
    let mut report = SweepReport {
        locks_cleared: state.store.clear_stale_locks(state.settings.stale_lock_age).await?,
        ..Default::default()
    };

    let window = state.settings.warning_window;
    let due_for_warning = state
        .store
        .query::<User>()
        .filter(move |u| !u.warned && u.self_destruct_at - now <= window)
        .results()
        .await?;

    for user in due_for_warning {
        let deadline = now + window;
        if let Err(e) = state.notifier.warn_inactive(&user, deadline) {
            // Left unwarned so the next sweep tries again.
            warn!("Could not notify {}: {}", user.email, e);
            continue;
        }
        state
            .store
            .query::<User>()
            .by_key(&user.email)
            .update(move |u| {
                u.self_destruct_at = deadline;
                u.warned = true;
            })
            .await?;
        report.warned.push(user.email);
    }

    let expired = state
        .store
        .query::<User>()
        .filter(move |u| u.warned && u.self_destruct_at < now)
        .results()
        .await?;

    for user in expired {
        if remove_user(state, &user.email).await? {
            report.deleted.push(user.email);
        }
    }

    Ok(report)
}
