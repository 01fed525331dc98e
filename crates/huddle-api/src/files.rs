use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use huddle_gateway::Session;
use huddle_types::events::{FileMeta, ServerEvent};
use huddle_types::models::{Encoding, FileAttachment, User};

use crate::channels::require_member;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub struct Upload {
    pub channel: String,
    pub file_name: String,
    pub payload: String,
    pub encoding: Encoding,
    pub key_material: Option<String>,
}

/// Hex SHA-256 of a base64 payload, rejecting anything that is not base64.
pub fn payload_digest(payload: &str) -> ApiResult<String> {
    let bytes = B64
        .decode(payload)
        .map_err(|e| ApiError::InvalidPayload(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub async fn upload(state: &AppState, session: &Session, user: &User, upload: Upload) -> ApiResult<()> {
    require_member(state, user, &upload.channel).await?;

    let file_name = upload.file_name.trim().to_string();
    if file_name.is_empty() {
        return Err(ApiError::InvalidPayload("file name must not be empty".into()));
    }
    let sha256 = payload_digest(&upload.payload)?;

    let file = FileAttachment {
        id: Uuid::new_v4().to_string(),
        channel: upload.channel,
        sender: user.email.clone(),
        timestamp: Utc::now(),
        file_name,
        payload: upload.payload,
        encoding: upload.encoding,
        key_material: upload.key_material,
        sha256,
    };
    let file = state.store.insert(file).await.map_err(|e| {
        warn!("Failed to store file from {}: {}", user.email, e);
        ApiError::InsertFailed
    })?;

    info!(
        "{} uploaded {} ({:?}) to {}",
        user.email, file.file_name, file.encoding, file.channel
    );
    state
        .registry
        .broadcast_to_channel(
            &file.channel,
            ServerEvent::FileReceived(FileMeta::from(&file)),
            Some(session.conn_id()),
        )
        .await;
    state
        .registry
        .send_to_conn(
            session.conn_id(),
            ServerEvent::FileStored {
                id: file.id,
                sha256: file.sha256,
            },
        )
        .await;
    Ok(())
}

pub async fn download(state: &AppState, session: &Session, user: &User, file_id: String) -> ApiResult<()> {
    let file = state
        .store
        .query::<FileAttachment>()
        .by_key(&file_id)
        .first()
        .await?
        .ok_or_else(|| ApiError::FileNotFound(file_id.clone()))?;
    require_member(state, user, &file.channel).await?;

    state
        .registry
        .send_to_conn(session.conn_id(), ServerEvent::FileData(file))
        .await;
    Ok(())
}
