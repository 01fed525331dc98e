use std::sync::Arc;
use std::time::Duration;

use huddle_gateway::Registry;
use huddle_store::Store;

use crate::notifier::{LogNotifier, Notifier};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: Store,
    pub registry: Registry,
    pub settings: Settings,
    pub notifier: Arc<dyn Notifier>,
}

impl AppStateInner {
    pub fn new(store: Store, registry: Registry, settings: Settings) -> AppState {
        Self::with_notifier(store, registry, settings, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        store: Store,
        registry: Registry,
        settings: Settings,
        notifier: Arc<dyn Notifier>,
    ) -> AppState {
        Arc::new(Self {
            store,
            registry,
            settings,
            notifier,
        })
    }
}

/// Tunables read from the environment by the server binary.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Inactivity allowed before an account is scheduled for deletion.
    pub inactivity: chrono::Duration,
    /// How far ahead of the deadline a warning goes out, and by how much
    /// the deadline is pushed back when it does.
    pub warning_window: chrono::Duration,
    /// Last-seen recency that counts as online.
    pub online_window: chrono::Duration,
    pub poll_interval: Duration,
    pub key_exchange_timeout: Duration,
    /// Largest history a single request may ask for.
    pub history_limit: usize,
    /// Age after which a lock marker is considered orphaned by the sweep.
    pub stale_lock_age: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            inactivity: chrono::Duration::days(90),
            warning_window: chrono::Duration::days(7),
            online_window: chrono::Duration::seconds(60),
            poll_interval: Duration::from_secs(5),
            key_exchange_timeout: Duration::from_secs(10),
            history_limit: 200,
            stale_lock_age: Duration::from_secs(60),
        }
    }
}
