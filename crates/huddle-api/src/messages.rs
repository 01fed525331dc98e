use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use huddle_gateway::Session;
use huddle_types::events::ServerEvent;
use huddle_types::models::{Message, User};

use crate::channels::{self, require_member};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// All messages of a channel, ascending by timestamp. Storage order breaks
/// ties.
pub async fn ordered(state: &AppState, channel_id: &str) -> ApiResult<Vec<Message>> {
    let mut messages = state
        .store
        .query::<Message>()
        .within(channel_id)
        .results()
        .await?;
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(messages)
}

/// The `count` most recent messages, ascending.
pub async fn recent(state: &AppState, channel_id: &str, count: usize) -> ApiResult<Vec<Message>> {
    let mut messages = ordered(state, channel_id).await?;
    let skip = messages.len().saturating_sub(count);
    Ok(messages.split_off(skip))
}

/// Reject history requests above the configured limit rather than
/// returning fewer messages than asked for.
pub fn check_history_count(state: &AppState, count: usize) -> ApiResult<()> {
    let limit = state.settings.history_limit;
    if count > limit {
        return Err(ApiError::InvalidPayload(format!(
            "at most {} messages can be requested, got {}",
            limit, count
        )));
    }
    Ok(())
}

/// Index of the timestamp closest to `target` in an ascending slice. On a
/// tie the earlier message wins.
pub fn nearest_index(timestamps: &[DateTime<Utc>], target: DateTime<Utc>) -> Option<usize> {
    if timestamps.is_empty() {
        return None;
    }

    // First index at or after the target; everything before it is earlier.
    let after = timestamps.partition_point(|t| *t < target);
    if after == 0 {
        return Some(0);
    }

    // Earliest message sharing the preceding timestamp.
    let before_ts = timestamps[after - 1];
    let before = timestamps.partition_point(|t| *t < before_ts);
    if after == timestamps.len() {
        return Some(before);
    }

    let before_gap = target - before_ts;
    let after_gap = timestamps[after] - target;
    if after_gap < before_gap {
        Some(after)
    } else {
        Some(before)
    }
}

/// Interpret a wall-clock time at a fixed UTC offset.
pub fn local_to_utc(local: NaiveDateTime, utc_offset_minutes: i32) -> ApiResult<DateTime<Utc>> {
    let offset = utc_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| ApiError::Parsing(format!("invalid UTC offset {} minutes", utc_offset_minutes)))?;
    offset
        .from_local_datetime(&local)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| ApiError::Parsing(format!("invalid local time {}", local)))
}

pub async fn send(
    state: &AppState,
    session: &Session,
    user: &User,
    channel_id: String,
    body: String,
) -> ApiResult<()> {
    require_member(state, user, &channel_id).await?;

    let message = Message::new(user.email.clone(), channel_id.clone(), body);
    let message = state.store.insert(message).await.map_err(|e| {
        warn!("Failed to store message from {} in {}: {}", user.email, channel_id, e);
        ApiError::InsertFailed
    })?;

    let delivered = state
        .registry
        .broadcast_to_channel(
            &channel_id,
            ServerEvent::MessageReceived(message.clone()),
            Some(session.conn_id()),
        )
        .await;
    debug!("Message {} in {} fanned out to {} connection(s)", message.id, channel_id, delivered);

    state
        .registry
        .send_to_conn(session.conn_id(), ServerEvent::MessageReceived(message))
        .await;
    Ok(())
}

pub async fn history(
    state: &AppState,
    session: &Session,
    user: &User,
    channel_id: String,
    count: usize,
) -> ApiResult<()> {
    require_member(state, user, &channel_id).await?;
    check_history_count(state, count)?;

    let mut messages = ordered(state, &channel_id).await?;
    if messages.is_empty() {
        return Err(ApiError::EmptyChannel(channel_id));
    }
    let skip = messages.len().saturating_sub(count);
    let messages = messages.split_off(skip);

    state
        .registry
        .send_to_conn(
            session.conn_id(),
            ServerEvent::History {
                channel: channel_id,
                messages,
            },
        )
        .await;
    Ok(())
}

pub async fn lookup(
    state: &AppState,
    session: &Session,
    user: &User,
    channel_id: String,
    local_time: NaiveDateTime,
    utc_offset_minutes: i32,
) -> ApiResult<()> {
    let target = local_to_utc(local_time, utc_offset_minutes)?;
    require_member(state, user, &channel_id).await?;

    let messages = ordered(state, &channel_id).await?;
    let timestamps: Vec<DateTime<Utc>> = messages.iter().map(|m| m.timestamp).collect();
    let index = nearest_index(&timestamps, target)
        .ok_or_else(|| ApiError::EmptyChannel(channel_id.clone()))?;

    state
        .registry
        .send_to_conn(
            session.conn_id(),
            ServerEvent::LookupResult {
                channel: channel_id,
                messages,
                index,
            },
        )
        .await;
    Ok(())
}

/// Remove one of the caller's own messages. The channel goes too if no
/// message from a live sender is left, even with members remaining.
pub async fn delete(
    state: &AppState,
    session: &Session,
    user: &User,
    channel_id: String,
    message_id: String,
) -> ApiResult<()> {
    let message = state
        .store
        .query::<Message>()
        .within(channel_id.as_str())
        .by_key(&message_id)
        .first()
        .await?
        .ok_or_else(|| ApiError::MessageNotFound(message_id.clone()))?;
    if message.sender != user.email {
        return Err(ApiError::NotOwner);
    }

    state
        .store
        .query::<Message>()
        .within(channel_id.as_str())
        .by_key(&message_id)
        .delete()
        .await?;

    let event = ServerEvent::MessageDeleted {
        channel: channel_id.clone(),
        message_id,
    };
    state
        .registry
        .broadcast_to_channel(&channel_id, event.clone(), Some(session.conn_id()))
        .await;
    state.registry.send_to_conn(session.conn_id(), event).await;

    if channels::prune_if_abandoned(state, &channel_id).await? {
        info!("Channel {} removed after its last live message was deleted", channel_id);
    }
    Ok(())
}
