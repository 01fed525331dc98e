use chrono::{DateTime, Utc};
use tracing::info;

use huddle_types::models::User;

/// Outbound notification seam. Mail delivery lives outside this crate; an
/// implementation should hand the notice off and return quickly.
pub trait Notifier: Send + Sync {
    fn warn_inactive(&self, user: &User, deletion_at: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Default notifier: records the notice in the log only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn warn_inactive(&self, user: &User, deletion_at: DateTime<Utc>) -> anyhow::Result<()> {
        info!(
            "Inactivity notice for {} ({}): account will be deleted at {}",
            user.nickname, user.email, deletion_at
        );
        Ok(())
    }
}
