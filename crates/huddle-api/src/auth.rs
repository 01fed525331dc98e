use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use huddle_gateway::{Identity, Session};
use huddle_store::StoreError;
use huddle_types::events::{Profile, ServerEvent};
use huddle_types::models::User;

use crate::accounts::validate_nickname;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const MIN_PASSWORD_LEN: usize = 8;

pub fn profile(user: &User) -> Profile {
    Profile {
        email: user.email.clone(),
        nickname: user.nickname.clone(),
        channels: user.channels.iter().cloned().collect(),
        friends: user.friends.iter().cloned().collect(),
        pending_invites: user.invites.len(),
    }
}

pub async fn signup(
    state: &AppState,
    session: &mut Session,
    email: String,
    nickname: String,
    password: String,
) -> ApiResult<()> {
    let email = email.trim().to_string();
    if !email.contains('@') {
        return Err(ApiError::Parsing("email must look like name@host".into()));
    }
    validate_nickname(&nickname)?;
    if password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::InvalidPayload(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    if state.store.query::<User>().by_key(&email).exists().await? {
        return Err(ApiError::DuplicateUser(email));
    }

    let password_hash = hash_password(password).await?;
    let now = Utc::now();
    let user = User {
        email: email.clone(),
        nickname,
        password_hash,
        channels: Default::default(),
        friends: Default::default(),
        last_seen: now,
        self_destruct_at: now + state.settings.inactivity,
        warned: false,
        public_key: None,
        invites: Vec::new(),
    };

    let user = match state.store.insert(user).await {
        Ok(user) => user,
        // Lost a race with another signup for the same address.
        Err(StoreError::Duplicate { .. }) => return Err(ApiError::DuplicateUser(email)),
        Err(e) => return Err(e.into()),
    };

    establish(state, session, &user).await;
    info!("{} ({}) signed up", user.nickname, user.email);
    state
        .registry
        .send_to_conn(session.conn_id(), ServerEvent::SignupSuccess(profile(&user)))
        .await;
    Ok(())
}

pub async fn login(
    state: &AppState,
    session: &mut Session,
    email: String,
    password: String,
) -> ApiResult<()> {
    let email = email.trim().to_string();
    let user = state
        .store
        .query::<User>()
        .by_key(&email)
        .first()
        .await?
        .ok_or_else(|| ApiError::UnknownUser(email.clone()))?;

    if !verify_password(password, user.password_hash.clone()).await? {
        warn!("Failed login for {}", email);
        return Err(ApiError::WrongPassword);
    }

    let user = touch_user(state, &email, Utc::now())
        .await?
        .ok_or(ApiError::UserVanished)?;

    establish(state, session, &user).await;
    info!("{} ({}) logged in", user.nickname, user.email);
    state
        .registry
        .send_to_conn(session.conn_id(), ServerEvent::LoginSuccess(profile(&user)))
        .await;
    Ok(())
}

async fn establish(state: &AppState, session: &mut Session, user: &User) {
    session.authenticate(user.email.clone());
    state
        .registry
        .authenticate(
            session.conn_id(),
            Identity {
                email: user.email.clone(),
                nickname: user.nickname.clone(),
            },
        )
        .await;
}

/// Record activity: last-seen moves forward to `now`, the self-destruct
/// deadline restarts, and any inactivity warning is withdrawn.
pub async fn touch_user(
    state: &AppState,
    email: &str,
    now: DateTime<Utc>,
) -> ApiResult<Option<User>> {
    let inactivity = state.settings.inactivity;
    let updated = state
        .store
        .query::<User>()
        .by_key(email)
        .update(move |u| {
            u.last_seen = u.last_seen.max(now);
            u.self_destruct_at = u.last_seen + inactivity;
            u.warned = false;
        })
        .await?;
    Ok(updated.into_iter().next())
}

async fn hash_password(password: String) -> ApiResult<String> {
    // Argon2 is deliberately slow; keep it off the async workers.
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))
    })
    .await
    .map_err(|e| ApiError::Internal(e.into()))?
    .map_err(ApiError::Internal)
}

async fn verify_password(password: String, stored: String) -> ApiResult<bool> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored)
            .map_err(|e| anyhow::anyhow!("stored hash unreadable: {}", e))?;
        Ok::<_, anyhow::Error>(
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
        )
    })
    .await
    .map_err(|e| ApiError::Internal(e.into()))?
    .map_err(ApiError::Internal)
}
