use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_gateway::{ConnId, Session};
use huddle_types::events::{Participant, ServerEvent};
use huddle_types::models::{Channel, FileAttachment, Message, User, Visibility};

use crate::error::{ApiError, ApiResult};
use crate::messages;
use crate::state::AppState;

pub async fn find_channel(state: &AppState, channel_id: &str) -> ApiResult<Channel> {
    state
        .store
        .query::<Channel>()
        .by_key(channel_id)
        .first()
        .await?
        .ok_or_else(|| ApiError::ChannelNotFound(channel_id.to_string()))
}

/// Channel must exist and `user` must belong to it.
pub async fn require_member(state: &AppState, user: &User, channel_id: &str) -> ApiResult<Channel> {
    let channel = find_channel(state, channel_id).await?;
    if !user.is_member(channel_id) {
        return Err(ApiError::NotMember(channel_id.to_string()));
    }
    Ok(channel)
}

pub async fn create(
    state: &AppState,
    session: &Session,
    user: &User,
    name: String,
    visibility: Visibility,
) -> ApiResult<()> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::Parsing("channel name must not be empty".into()));
    }

    let wanted = name.to_lowercase();
    let taken = state
        .store
        .query::<Channel>()
        .filter(move |c| c.name.to_lowercase() == wanted)
        .exists()
        .await?;
    if taken {
        return Err(ApiError::DuplicateChannel(name));
    }

    let channel = state.store.insert(Channel::new(name, visibility)).await?;
    let id = channel.id.clone();
    state
        .store
        .query::<User>()
        .by_key(&user.email)
        .update(move |u| {
            u.channels.insert(id.clone());
        })
        .await?;

    info!("{} created channel {} ({})", user.email, channel.name, channel.id);
    state
        .registry
        .send_to_conn(session.conn_id(), ServerEvent::ChannelCreated(channel))
        .await;
    Ok(())
}

pub async fn join(
    state: &AppState,
    session: &Session,
    user: &User,
    channel_id: String,
    history: Option<usize>,
) -> ApiResult<()> {
    let channel = find_channel(state, &channel_id).await?;
    if user.is_member(&channel_id) {
        return Err(ApiError::AlreadyMember(channel_id));
    }

    let invite = user.invite_for(&channel_id).cloned();
    if !channel.is_public() && invite.is_none() {
        return Err(ApiError::NotMember(channel_id));
    }
    if let Some(n) = history {
        messages::check_history_count(state, n)?;
    }

    let id = channel_id.clone();
    let updated = state
        .store
        .query::<User>()
        .by_key(&user.email)
        .update(move |u| {
            u.channels.insert(id.clone());
            u.invites.retain(|i| i.channel_id != id);
        })
        .await?;
    if updated.is_empty() {
        return Err(ApiError::UserVanished);
    }

    let history = match history {
        Some(n) => messages::recent(state, &channel_id, n).await?,
        None => Vec::new(),
    };

    state.registry.open_channel(session.conn_id(), &channel_id).await;
    info!("{} joined {}", user.email, channel.name);
    state
        .registry
        .send_to_conn(
            session.conn_id(),
            ServerEvent::JoinComplete {
                channel,
                history,
                encrypted_secret: invite.map(|i| i.encrypted_secret),
            },
        )
        .await;
    Ok(())
}

pub async fn leave(
    state: &AppState,
    session: &mut Session,
    user: &User,
    channel_id: String,
) -> ApiResult<()> {
    if !user.is_member(&channel_id) {
        return Err(ApiError::NotMember(channel_id));
    }

    let id = channel_id.clone();
    state
        .store
        .query::<User>()
        .by_key(&user.email)
        .update(move |u| {
            u.channels.remove(&id);
        })
        .await?;

    state.registry.close_channel(session.conn_id(), &channel_id).await;
    session.stop_polling(Some(&channel_id));

    let deleted = prune_if_abandoned(state, &channel_id).await?;
    info!("{} left {}", user.email, channel_id);
    state
        .registry
        .send_to_conn(
            session.conn_id(),
            ServerEvent::LeaveComplete {
                channel: channel_id,
                deleted,
            },
        )
        .await;
    Ok(())
}

/// Delete a channel once no message from a live sender remains in it,
/// whether or not it still has members. Its messages, files, pending
/// invites, memberships and viewers go with it. Returns whether it was
/// deleted.
pub async fn prune_if_abandoned(state: &AppState, channel_id: &str) -> ApiResult<bool> {
    let has_live_sender = state
        .store
        .query::<Message>()
        .within(channel_id)
        .filter(|m| !m.is_tombstoned())
        .exists()
        .await?;
    if has_live_sender {
        return Ok(false);
    }

    let removed = state.store.query::<Channel>().by_key(channel_id).delete().await?;
    let messages = state.store.query::<Message>().within(channel_id).delete().await?;

    let id = channel_id.to_string();
    let files = state
        .store
        .query::<FileAttachment>()
        .filter(move |f| f.channel == id)
        .delete()
        .await?;

    let touched = channel_id.to_string();
    let dropped = channel_id.to_string();
    let members = state
        .store
        .query::<User>()
        .filter(move |u| u.is_member(&touched) || u.invite_for(&touched).is_some())
        .update(move |u| {
            u.channels.remove(&dropped);
            u.invites.retain(|i| i.channel_id != dropped);
        })
        .await?;
    state.registry.clear_channel(channel_id).await;

    if removed > 0 {
        info!(
            "Channel {} has no live senders left: removed with {} message(s), {} file(s), {} member(s)",
            channel_id,
            messages,
            files,
            members.len()
        );
    }
    Ok(removed > 0)
}

pub async fn list(state: &AppState, session: &Session, user: &User) -> ApiResult<()> {
    let channels = state.store.query::<Channel>().results().await?;
    let (joined, others): (Vec<Channel>, Vec<Channel>) =
        channels.into_iter().partition(|c| user.is_member(&c.id));
    let public = others.into_iter().filter(|c| c.is_public()).collect();

    state
        .registry
        .send_to_conn(session.conn_id(), ServerEvent::ChannelList { joined, public })
        .await;
    Ok(())
}

/// Member list of a channel with an online flag derived from last-seen.
pub async fn participants(state: &AppState, channel_id: &str) -> ApiResult<Vec<Participant>> {
    let id = channel_id.to_string();
    let members = state
        .store
        .query::<User>()
        .filter(move |u| u.channels.contains(&id))
        .results()
        .await?;

    let now = Utc::now();
    let window = state.settings.online_window;
    let mut users: Vec<Participant> = members
        .into_iter()
        .map(|u| Participant {
            online: now - u.last_seen <= window,
            email: u.email,
            nickname: u.nickname,
        })
        .collect();
    users.sort_by(|a, b| a.nickname.cmp(&b.nickname).then_with(|| a.email.cmp(&b.email)));
    Ok(users)
}

pub async fn participants_request(
    state: &AppState,
    session: &Session,
    user: &User,
    channel_id: String,
) -> ApiResult<()> {
    require_member(state, user, &channel_id).await?;
    let users = participants(state, &channel_id).await?;
    state
        .registry
        .send_to_conn(
            session.conn_id(),
            ServerEvent::Participants {
                channel: channel_id,
                users,
            },
        )
        .await;
    Ok(())
}

/// Client started viewing a channel: record presence and start pushing the
/// participant list on a fixed interval.
pub async fn open(
    state: &AppState,
    session: &mut Session,
    user: &User,
    channel_id: String,
) -> ApiResult<()> {
    require_member(state, user, &channel_id).await?;
    state.registry.open_channel(session.conn_id(), &channel_id).await;

    let handle = spawn_participant_poll(
        state.clone(),
        session.conn_id(),
        user.email.clone(),
        channel_id.clone(),
    );
    session.start_polling(channel_id, handle);
    Ok(())
}

pub async fn close(state: &AppState, session: &mut Session, channel_id: String) {
    state.registry.close_channel(session.conn_id(), &channel_id).await;
    session.stop_polling(Some(&channel_id));
}

/// Push the participant list every poll interval until the user stops
/// viewing the channel, loses membership, or the connection goes away.
/// A store failure skips one cycle only.
fn spawn_participant_poll(
    state: AppState,
    conn_id: ConnId,
    email: String,
    channel_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.settings.poll_interval);

        loop {
            interval.tick().await;

            if state.registry.viewing(conn_id).await.as_deref() != Some(channel_id.as_str()) {
                break;
            }

            let still_member = match state.store.query::<User>().by_key(&email).first().await {
                Ok(user) => user.is_some_and(|u| u.is_member(&channel_id)),
                Err(e) => {
                    warn!("Participant poll for {} on {} failed: {}", email, channel_id, e);
                    continue;
                }
            };
            if !still_member {
                let refusal = ApiError::NotMember(channel_id.clone()).to_refusal();
                state
                    .registry
                    .send_to_conn(conn_id, ServerEvent::ParticipantsFailed(refusal))
                    .await;
                break;
            }

            match participants(&state, &channel_id).await {
                Ok(users) => {
                    let event = ServerEvent::Participants {
                        channel: channel_id.clone(),
                        users,
                    };
                    if !state.registry.send_to_conn(conn_id, event).await {
                        break;
                    }
                }
                Err(e) => warn!("Participant poll for {} on {} failed: {}", email, channel_id, e),
            }
        }

        debug!("Participant poll for {} on {} stopped", email, channel_id);
    })
}
