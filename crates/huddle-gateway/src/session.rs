use tokio::task::JoinHandle;

use crate::registry::ConnId;

/// Protocol state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Unauthenticated,
    Authenticated { email: String },
    Closed,
}

/// Per-connection state owned by the connection task. Only one frame is
/// handled at a time, so no locking is needed.
#[derive(Debug)]
pub struct Session {
    conn_id: ConnId,
    phase: Phase,
    poller: Option<Poller>,
}

#[derive(Debug)]
struct Poller {
    channel: String,
    handle: JoinHandle<()>,
}

impl Session {
    pub fn new(conn_id: ConnId) -> Self {
        Self {
            conn_id,
            phase: Phase::Unauthenticated,
            poller: None,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn email(&self) -> Option<&str> {
        match &self.phase {
            Phase::Authenticated { email } => Some(email),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// UNAUTHENTICATED -> AUTHENTICATED. Refused from any other phase.
    pub fn authenticate(&mut self, email: String) -> bool {
        if self.phase != Phase::Unauthenticated {
            return false;
        }
        self.phase = Phase::Authenticated { email };
        true
    }

    /// Enter the terminal phase. Stops participant polling.
    pub fn close(&mut self) {
        self.stop_polling(None);
        self.phase = Phase::Closed;
    }

    /// Replace the participant poller with one for `channel`.
    pub fn start_polling(&mut self, channel: String, handle: JoinHandle<()>) {
        self.stop_polling(None);
        self.poller = Some(Poller { channel, handle });
    }

    /// Stop polling. With `Some(channel)`, only if it is that channel's
    /// poller. Returns whether a poller was stopped.
    pub fn stop_polling(&mut self, channel: Option<&str>) -> bool {
        let matches = match (&self.poller, channel) {
            (Some(p), Some(c)) => p.channel == c,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            if let Some(p) = self.poller.take() {
                p.handle.abort();
            }
        }
        matches
    }

    pub fn polling_channel(&self) -> Option<&str> {
        self.poller.as_ref().map(|p| p.channel.as_str())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_polling(None);
    }
}
