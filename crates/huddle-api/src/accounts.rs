use std::collections::BTreeSet;

use tracing::info;

use huddle_gateway::{Flow, Session};
use huddle_types::events::ServerEvent;
use huddle_types::models::{FileAttachment, Message, TOMBSTONE_SENDER, User};

use crate::channels::prune_if_abandoned;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const NICKNAME_MIN: usize = 3;
pub const NICKNAME_MAX: usize = 10;

pub fn validate_nickname(nickname: &str) -> ApiResult<()> {
    let len = nickname.chars().count();
    if len < NICKNAME_MIN {
        return Err(ApiError::NicknameTooShort { min: NICKNAME_MIN });
    }
    if len > NICKNAME_MAX {
        return Err(ApiError::NicknameTooLong { max: NICKNAME_MAX });
    }
    Ok(())
}

pub async fn change_nickname(
    state: &AppState,
    user: &User,
    nickname: String,
) -> ApiResult<()> {
    validate_nickname(&nickname)?;

    let new_name = nickname.clone();
    let updated = state
        .store
        .query::<User>()
        .by_key(&user.email)
        .update(move |u| u.nickname = new_name.clone())
        .await?;
    if updated.is_empty() {
        return Err(ApiError::UserVanished);
    }

    state.registry.rename(&user.email, &nickname).await;
    info!("{} is now known as {}", user.email, nickname);

    // Every authenticated connection, the requester's included.
    state
        .registry
        .broadcast(ServerEvent::NicknameChanged {
            email: user.email.clone(),
            nickname,
        })
        .await;
    Ok(())
}

/// Delete the caller's own account. Ends the connection on success.
pub async fn delete_account(
    state: &AppState,
    session: &mut Session,
    user: &User,
    email: String,
) -> ApiResult<Flow> {
    if email != user.email {
        return Err(ApiError::NotOwner);
    }

    session.stop_polling(None);
    remove_user(state, &user.email).await?;

    state
        .registry
        .send_to_conn(session.conn_id(), ServerEvent::AccountDeleted)
        .await;
    session.close();
    Ok(Flow::Close)
}

/// Delete a user and cascade: their messages and files are re-attributed
/// to the tombstone sender, friends forget them, and channels left
/// abandoned are removed. Returns false if the user did not exist.
pub async fn remove_user(state: &AppState, email: &str) -> ApiResult<bool> {
    let Some(user) = state.store.query::<User>().by_key(email).first().await? else {
        return Ok(false);
    };

    let sender = email.to_string();
    let rewritten = state
        .store
        .query::<Message>()
        .filter(move |m| m.sender == sender)
        .update(|m| m.sender = TOMBSTONE_SENDER.to_string())
        .await?;

    let sender = email.to_string();
    state
        .store
        .query::<FileAttachment>()
        .filter(move |f| f.sender == sender)
        .update(|f| f.sender = TOMBSTONE_SENDER.to_string())
        .await?;

    state.store.query::<User>().by_key(email).delete().await?;

    let gone = email.to_string();
    let forget = email.to_string();
    state
        .store
        .query::<User>()
        .filter(move |u| u.friends.contains(&gone))
        .update(move |u| {
            u.friends.remove(&forget);
        })
        .await?;

    let mut touched: BTreeSet<String> = user.channels.clone();
    touched.extend(rewritten.into_iter().map(|m| m.channel));
    let mut pruned = 0;
    for channel_id in &touched {
        if prune_if_abandoned(state, channel_id).await? {
            pruned += 1;
        }
    }

    state.registry.drop_user(email).await;
    info!(
        "Removed user {} ({} channel(s) checked, {} pruned)",
        email,
        touched.len(),
        pruned
    );
    Ok(true)
}

// -- Friends --

async fn require_user(state: &AppState, email: &str) -> ApiResult<User> {
    state
        .store
        .query::<User>()
        .by_key(email)
        .first()
        .await?
        .ok_or_else(|| ApiError::UnknownUser(email.to_string()))
}

async fn set_friend(state: &AppState, owner: &str, friend: &str, friends: bool) -> ApiResult<()> {
    let friend = friend.to_string();
    state
        .store
        .query::<User>()
        .by_key(owner)
        .update(move |u| {
            if friends {
                u.friends.insert(friend.clone());
            } else {
                u.friends.remove(&friend);
            }
        })
        .await?;
    Ok(())
}

/// Make `a` and `b` friends of each other.
pub async fn make_friends(state: &AppState, a: &str, b: &str) -> ApiResult<()> {
    if a == b {
        return Err(ApiError::Parsing("cannot befriend yourself".into()));
    }
    require_user(state, a).await?;
    require_user(state, b).await?;
    set_friend(state, a, b, true).await?;
    set_friend(state, b, a, true).await
}

pub async fn break_up_friends(state: &AppState, a: &str, b: &str) -> ApiResult<()> {
    require_user(state, a).await?;
    set_friend(state, a, b, false).await?;
    // The other side may already be gone.
    set_friend(state, b, a, false).await
}

pub async fn check_friends(state: &AppState, a: &str, b: &str) -> ApiResult<bool> {
    Ok(require_user(state, a).await?.friends.contains(b))
}

pub async fn friend_add(state: &AppState, session: &Session, user: &User, email: String) -> ApiResult<()> {
    make_friends(state, &user.email, &email).await?;
    state
        .registry
        .send_to_user(
            &email,
            ServerEvent::FriendUpdated {
                email: user.email.clone(),
                friends: true,
            },
        )
        .await;
    state
        .registry
        .send_to_conn(session.conn_id(), ServerEvent::FriendUpdated { email, friends: true })
        .await;
    Ok(())
}

pub async fn friend_remove(
    state: &AppState,
    session: &Session,
    user: &User,
    email: String,
) -> ApiResult<()> {
    break_up_friends(state, &user.email, &email).await?;
    state
        .registry
        .send_to_user(
            &email,
            ServerEvent::FriendUpdated {
                email: user.email.clone(),
                friends: false,
            },
        )
        .await;
    state
        .registry
        .send_to_conn(session.conn_id(), ServerEvent::FriendUpdated { email, friends: false })
        .await;
    Ok(())
}

pub async fn friend_list(state: &AppState, session: &Session, user: &User) -> ApiResult<()> {
    state
        .registry
        .send_to_conn(
            session.conn_id(),
            ServerEvent::FriendList {
                friends: user.friends.iter().cloned().collect(),
            },
        )
        .await;
    Ok(())
}
