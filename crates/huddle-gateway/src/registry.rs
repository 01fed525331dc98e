use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use huddle_types::events::ServerEvent;

pub type ConnId = Uuid;

/// Identity cached for an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub email: String,
    pub nickname: String,
}

/// Tracks live connections, who they belong to, and which channel each
/// connection is currently viewing. Nothing here is persisted; the registry is
/// created at server start and cleared at shutdown.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// conn_id -> outbound queue and identity (None until login)
    connections: RwLock<HashMap<ConnId, ConnectionEntry>>,

    /// conn_id -> channel that connection currently has open
    viewing: RwLock<HashMap<ConnId, String>>,

    /// request_id -> pending public-key exchange
    pending_keys: Mutex<HashMap<Uuid, PendingKeyRequest>>,
}

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<ServerEvent>,
    identity: Option<Identity>,
}

struct PendingKeyRequest {
    requester: String,
    target: String,
    reply: oneshot::Sender<Option<String>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: RwLock::new(HashMap::new()),
                viewing: RwLock::new(HashMap::new()),
                pending_keys: Mutex::new(HashMap::new()),
            }),
        }
    }

    // -- Connections --

    /// Register a new, unauthenticated connection. Returns (conn_id, receiver).
    pub async fn register_connection(&self) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .await
            .insert(conn_id, ConnectionEntry { tx, identity: None });
        (conn_id, rx)
    }

    /// Drop a connection and its presence. When it was the user's last one,
    /// any key requests involving them go too.
    pub async fn unregister_connection(&self, conn_id: ConnId) -> Option<Identity> {
        let (identity, still_online) = {
            let mut connections = self.inner.connections.write().await;
            let identity = connections.remove(&conn_id).and_then(|e| e.identity);
            let still_online = identity.as_ref().is_some_and(|id| {
                connections
                    .values()
                    .any(|e| e.identity.as_ref().is_some_and(|other| other.email == id.email))
            });
            (identity, still_online)
        };

        self.inner.viewing.write().await.remove(&conn_id);
        if let Some(id) = &identity {
            if !still_online {
                self.drop_key_requests_for(&id.email).await;
            }
        }
        identity
    }

    /// Attach an identity to a connection after login/signup.
    pub async fn authenticate(&self, conn_id: ConnId, identity: Identity) -> bool {
        let mut connections = self.inner.connections.write().await;
        match connections.get_mut(&conn_id) {
            Some(entry) => {
                entry.identity = Some(identity);
                true
            }
            None => false,
        }
    }

    pub async fn identity(&self, conn_id: ConnId) -> Option<Identity> {
        self.inner
            .connections
            .read()
            .await
            .get(&conn_id)
            .and_then(|e| e.identity.clone())
    }

    /// Update the cached nickname on every connection of `email`.
    pub async fn rename(&self, email: &str, nickname: &str) {
        let mut connections = self.inner.connections.write().await;
        for entry in connections.values_mut() {
            if let Some(id) = entry.identity.as_mut().filter(|id| id.email == email) {
                id.nickname = nickname.to_string();
            }
        }
    }

    /// Forget a deleted user: presence, pending key requests, and the
    /// identity on any connection still open for them.
    pub async fn drop_user(&self, email: &str) {
        let mut orphaned = Vec::new();
        {
            let mut connections = self.inner.connections.write().await;
            for (conn_id, entry) in connections.iter_mut() {
                if entry.identity.as_ref().is_some_and(|id| id.email == email) {
                    entry.identity = None;
                    orphaned.push(*conn_id);
                }
            }
        }
        {
            let mut viewing = self.inner.viewing.write().await;
            for conn_id in &orphaned {
                viewing.remove(conn_id);
            }
        }
        self.drop_key_requests_for(email).await;
    }

    pub async fn is_online(&self, email: &str) -> bool {
        self.inner
            .connections
            .read()
            .await
            .values()
            .any(|e| e.identity.as_ref().is_some_and(|id| id.email == email))
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    // -- Delivery --

    /// Queue an event for one connection.
    pub async fn send_to_conn(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        let connections = self.inner.connections.read().await;
        match connections.get(&conn_id) {
            Some(entry) => entry.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Queue an event for every connection of `email`. Returns how many
    /// connections accepted it.
    pub async fn send_to_user(&self, email: &str, event: ServerEvent) -> usize {
        let connections = self.inner.connections.read().await;
        connections
            .values()
            .filter(|e| e.identity.as_ref().is_some_and(|id| id.email == email))
            .filter(|e| e.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Queue an event for every authenticated connection.
    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        let connections = self.inner.connections.read().await;
        connections
            .values()
            .filter(|e| e.identity.is_some())
            .filter(|e| e.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Queue an event for every authenticated connection viewing `channel`,
    /// optionally skipping one connection. A closed recipient is skipped
    /// without affecting the others.
    pub async fn broadcast_to_channel(
        &self,
        channel: &str,
        event: ServerEvent,
        except: Option<ConnId>,
    ) -> usize {
        let viewers: HashSet<ConnId> = self.viewers(channel).await.into_iter().collect();
        if viewers.is_empty() {
            return 0;
        }

        let connections = self.inner.connections.read().await;
        let mut delivered = 0;
        for (conn_id, entry) in connections.iter() {
            if Some(*conn_id) == except || !viewers.contains(conn_id) || entry.identity.is_none() {
                continue;
            }
            if entry.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    // -- Presence --

    /// Presence is per connection: one user may view different channels
    /// from different connections.
    pub async fn open_channel(&self, conn_id: ConnId, channel: &str) {
        self.inner
            .viewing
            .write()
            .await
            .insert(conn_id, channel.to_string());
    }

    /// Clear presence, but only if the connection is still viewing `channel`.
    pub async fn close_channel(&self, conn_id: ConnId, channel: &str) -> bool {
        let mut viewing = self.inner.viewing.write().await;
        if viewing.get(&conn_id).is_some_and(|c| c == channel) {
            viewing.remove(&conn_id);
            true
        } else {
            false
        }
    }

    /// Forget every viewer of a channel that no longer exists.
    pub async fn clear_channel(&self, channel: &str) -> usize {
        let mut viewing = self.inner.viewing.write().await;
        let before = viewing.len();
        viewing.retain(|_, c| c != channel);
        before - viewing.len()
    }

    pub async fn viewing(&self, conn_id: ConnId) -> Option<String> {
        self.inner.viewing.read().await.get(&conn_id).cloned()
    }

    pub async fn viewers(&self, channel: &str) -> Vec<ConnId> {
        self.inner
            .viewing
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.as_str() == channel)
            .map(|(conn_id, _)| *conn_id)
            .collect()
    }

    // -- Key exchange correlation --

    /// Open a pending public-key request. The receiver resolves with the
    /// target's answer (`None` for a refusal) or errors if the request is
    /// dropped.
    pub async fn begin_key_request(
        &self,
        requester: &str,
        target: &str,
    ) -> (Uuid, oneshot::Receiver<Option<String>>) {
        let request_id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        self.inner.pending_keys.lock().await.insert(
            request_id,
            PendingKeyRequest {
                requester: requester.to_string(),
                target: target.to_string(),
                reply,
            },
        );
        (request_id, rx)
    }

    /// Resolve a pending request. Only the addressed target may answer.
    pub async fn complete_key_request(
        &self,
        request_id: Uuid,
        responder: &str,
        public_key: Option<String>,
    ) -> bool {
        let mut pending = self.inner.pending_keys.lock().await;
        match pending.get(&request_id) {
            Some(req) if req.target == responder => {}
            _ => return false,
        }
        let Some(req) = pending.remove(&request_id) else {
            return false;
        };
        debug!("Key request {} from {} answered by {}", request_id, req.requester, responder);
        req.reply.send(public_key).is_ok()
    }

    pub async fn cancel_key_request(&self, request_id: Uuid) {
        self.inner.pending_keys.lock().await.remove(&request_id);
    }

    async fn drop_key_requests_for(&self, email: &str) {
        self.inner
            .pending_keys
            .lock()
            .await
            .retain(|_, req| req.target != email && req.requester != email);
    }

    /// Drop everything. Outbound queues close, which ends every
    /// connection's writer.
    pub async fn clear(&self) {
        self.inner.connections.write().await.clear();
        self.inner.viewing.write().await.clear();
        self.inner.pending_keys.lock().await.clear();
    }
}
