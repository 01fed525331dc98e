//! Public-key exchange and channel-secret distribution.
//!
//! The server only relays key material. A channel secret travels to each
//! invitee encrypted under that invitee's registered public key, so an
//! invite cannot be issued to someone without one.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_gateway::Session;
use huddle_types::events::ServerEvent;
use huddle_types::models::{Invite, User};

use crate::channels::require_member;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Accept base64 key material with a non-empty decoded body.
pub fn validate_key(encoded: &str) -> ApiResult<()> {
    let bytes = B64
        .decode(encoded.trim())
        .map_err(|e| ApiError::InvalidKey(e.to_string()))?;
    if bytes.is_empty() {
        return Err(ApiError::InvalidKey("empty key".into()));
    }
    Ok(())
}

pub async fn publish(state: &AppState, session: &Session, user: &User, public_key: String) -> ApiResult<()> {
    validate_key(&public_key)?;

    let key = public_key.trim().to_string();
    let updated = state
        .store
        .query::<User>()
        .by_key(&user.email)
        .update(move |u| u.public_key = Some(key.clone()))
        .await?;
    if updated.is_empty() {
        return Err(ApiError::UserVanished);
    }

    info!("{} published a public key", user.email);
    state
        .registry
        .send_to_conn(session.conn_id(), ServerEvent::PublicKeyRegistered)
        .await;
    Ok(())
}

/// Look up `target`'s public key. A registered key is returned at once;
/// otherwise an online target is asked directly and the answer is awaited
/// in the background so this connection keeps serving frames.
pub async fn request(state: &AppState, session: &Session, user: &User, target: String) -> ApiResult<()> {
    let peer = state
        .store
        .query::<User>()
        .by_key(&target)
        .first()
        .await?
        .ok_or_else(|| ApiError::UnknownUser(target.clone()))?;

    if let Some(public_key) = peer.public_key {
        state
            .registry
            .send_to_conn(session.conn_id(), ServerEvent::PublicKeyResponse { target, public_key })
            .await;
        return Ok(());
    }

    if !state.registry.is_online(&target).await {
        return Err(ApiError::KeyUnavailable(target));
    }

    let (request_id, reply) = state.registry.begin_key_request(&user.email, &target).await;
    let asked = state
        .registry
        .send_to_user(
            &target,
            ServerEvent::PublicKeyRequested {
                request_id,
                from: user.email.clone(),
            },
        )
        .await;
    if asked == 0 {
        state.registry.cancel_key_request(request_id).await;
        return Err(ApiError::KeyUnavailable(target));
    }
    debug!("Key request {} from {} relayed to {}", request_id, user.email, target);

    let state = state.clone();
    let conn_id = session.conn_id();
    tokio::spawn(async move {
        let outcome = match tokio::time::timeout(state.settings.key_exchange_timeout, reply).await {
            Ok(Ok(Some(public_key))) => Ok(public_key),
            Ok(Ok(None)) => Err(ApiError::KeyRefused(target.clone())),
            Ok(Err(_)) => Err(ApiError::KeyUnavailable(target.clone())),
            Err(_) => {
                state.registry.cancel_key_request(request_id).await;
                Err(ApiError::KeyTimeout(target.clone()))
            }
        };

        let event = match outcome {
            Ok(public_key) => ServerEvent::PublicKeyResponse { target, public_key },
            Err(e) => {
                warn!("Key request {} failed: {}", request_id, e);
                ServerEvent::PublicKeyFailed(e.to_refusal())
            }
        };
        state.registry.send_to_conn(conn_id, event).await;
    });
    Ok(())
}

/// Answer a relayed key request. `None` refuses it.
pub async fn reply(
    state: &AppState,
    user: &User,
    request_id: Uuid,
    public_key: Option<String>,
) -> ApiResult<()> {
    if let Some(key) = &public_key {
        validate_key(key)?;
    }
    let answered = state
        .registry
        .complete_key_request(request_id, &user.email, public_key.map(|k| k.trim().to_string()))
        .await;
    if !answered {
        return Err(ApiError::KeyUnavailable(format!("request {}", request_id)));
    }
    Ok(())
}

pub async fn invite(
    state: &AppState,
    session: &Session,
    user: &User,
    channel_id: String,
    invitee: String,
    encrypted_secret: String,
) -> ApiResult<()> {
    require_member(state, user, &channel_id).await?;
    if encrypted_secret.trim().is_empty() {
        return Err(ApiError::InvalidPayload("encrypted secret must not be empty".into()));
    }

    let peer = state
        .store
        .query::<User>()
        .by_key(&invitee)
        .first()
        .await?
        .ok_or_else(|| ApiError::UnknownUser(invitee.clone()))?;
    if peer.public_key.is_none() {
        return Err(ApiError::KeyUnavailable(invitee));
    }
    if peer.is_member(&channel_id) {
        return Err(ApiError::AlreadyMember(channel_id));
    }

    let invite = Invite {
        channel_id: channel_id.clone(),
        from: user.email.clone(),
        encrypted_secret,
    };
    let stored = invite.clone();
    let updated = state
        .store
        .query::<User>()
        .by_key(&invitee)
        .update(move |u| {
            u.invites.retain(|i| i.channel_id != stored.channel_id);
            u.invites.push(stored.clone());
        })
        .await?;
    if updated.is_empty() {
        return Err(ApiError::UnknownUser(invitee));
    }

    info!("{} invited {} to {}", user.email, invitee, channel_id);
    state
        .registry
        .send_to_user(&invitee, ServerEvent::InviteReceived(invite))
        .await;
    state
        .registry
        .send_to_conn(
            session.conn_id(),
            ServerEvent::InviteSent {
                channel: channel_id,
                invitee,
            },
        )
        .await;
    Ok(())
}

pub async fn list_invites(state: &AppState, session: &Session, user: &User) -> ApiResult<()> {
    state
        .registry
        .send_to_conn(
            session.conn_id(),
            ServerEvent::InviteList {
                invites: user.invites.clone(),
            },
        )
        .await;
    Ok(())
}
