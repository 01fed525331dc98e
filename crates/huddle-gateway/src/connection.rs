use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use huddle_types::codes::ErrorCode;
use huddle_types::events::{Refusal, ServerEvent};

use crate::registry::Registry;
use crate::session::Session;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long the writer gets to flush queued frames after the reader stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What the connection should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Application side of a connection. The gateway owns the socket and the
/// registry entry; the handler owns the meaning of each frame.
pub trait FrameHandler: Clone + Send + Sync + 'static {
    fn handle_frame<'a>(
        &'a self,
        session: &'a mut Session,
        text: &'a str,
    ) -> impl Future<Output = Flow> + Send + 'a;

    /// Called whenever the client answers a keep-alive probe.
    fn handle_heartbeat<'a>(&'a self, session: &'a Session) -> impl Future<Output = ()> + Send + 'a;

    /// Called once when the connection ends, before it leaves the registry.
    fn handle_close<'a>(&'a self, session: &'a mut Session) -> impl Future<Output = ()> + Send + 'a;
}

/// Drive one WebSocket connection until the client leaves, the handler asks
/// to close, the heartbeat times out, or `shutdown` fires. Frames are
/// handled strictly one at a time; shutdown is only observed between frames
/// so an in-flight handler always finishes.
pub async fn handle_connection<H: FrameHandler>(
    socket: WebSocket,
    registry: Registry,
    handler: H,
    shutdown: CancellationToken,
) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut outbound) = registry.register_connection().await;
    let mut session = Session::new(conn_id);
    debug!("Connection {} opened", conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();

    // Forward queued events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else {
                        // Registry dropped us: flush is done, say goodbye.
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode outbound event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut writer_done = false;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Connection {} closing for shutdown", conn_id);
                break;
            }
            _ = &mut send_task => {
                writer_done = true;
                break;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handler.handle_frame(&mut session, text.as_str()).await == Flow::Close {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        registry
                            .send_to_conn(
                                conn_id,
                                ServerEvent::Error(Refusal::new(
                                    ErrorCode::Parsing,
                                    "binary frames are not supported",
                                )),
                            )
                            .await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_received.store(true, Ordering::Release);
                        handler.handle_heartbeat(&session).await;
                    }
                    // Pings are answered by the WebSocket layer itself.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Connection {} transport error: {}", conn_id, e);
                        break;
                    }
                }
            }
        }
    }

    handler.handle_close(&mut session).await;
    let identity = registry.unregister_connection(conn_id).await;

    // Unregistering closed the outbound queue; let the writer drain it.
    if !writer_done && tokio::time::timeout(DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }

    match identity {
        Some(id) => info!("{} ({}) disconnected", id.nickname, id.email),
        None => debug!("Connection {} closed", conn_id),
    }
}
