pub mod connection;
pub mod registry;
pub mod session;

pub use connection::{Flow, FrameHandler, handle_connection};
pub use registry::{ConnId, Identity, Registry};
pub use session::{Phase, Session};
