pub mod accounts;
pub mod auth;
pub mod channels;
pub mod error;
pub mod files;
pub mod keys;
pub mod maintenance;
pub mod messages;
pub mod notifier;
pub mod router;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use notifier::{LogNotifier, Notifier};
pub use router::Router;
pub use state::{AppState, AppStateInner, Settings};
