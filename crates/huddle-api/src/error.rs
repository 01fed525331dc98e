use thiserror::Error;
use tracing::error;

use huddle_store::StoreError;
use huddle_types::codes::ErrorCode;
use huddle_types::events::Refusal;

/// Failures surfaced to the originating connection.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unable to parse frame: {0}")]
    Parsing(String),

    #[error("log in first")]
    Permission,

    #[error("wrong password")]
    WrongPassword,

    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("{0} is already registered")]
    DuplicateUser(String),

    #[error("channel {0} does not exist")]
    ChannelNotFound(String),

    #[error("not a member of {0}")]
    NotMember(String),

    #[error("already a member of {0}")]
    AlreadyMember(String),

    #[error("a channel named {0} already exists")]
    DuplicateChannel(String),

    #[error("message could not be stored")]
    InsertFailed,

    #[error("message {0} not found")]
    MessageNotFound(String),

    #[error("channel {0} has no messages")]
    EmptyChannel(String),

    #[error("nickname must be at least {min} characters")]
    NicknameTooShort { min: usize },

    #[error("nickname must be at most {max} characters")]
    NicknameTooLong { max: usize },

    #[error("account no longer exists")]
    UserVanished,

    #[error("you can only delete your own account")]
    NotOwner,

    #[error("no public key available for {0}")]
    KeyUnavailable(String),

    #[error("{0} refused to share a public key")]
    KeyRefused(String),

    #[error("{0} did not answer the key request in time")]
    KeyTimeout(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("file {0} not found")]
    FileNotFound(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parsing(_) => ErrorCode::Parsing,
            Self::Permission => ErrorCode::Permission,
            Self::WrongPassword => ErrorCode::WrongPassword,
            Self::UnknownUser(_) => ErrorCode::UnknownUser,
            Self::DuplicateUser(_) => ErrorCode::DuplicateUser,
            Self::ChannelNotFound(_) => ErrorCode::ChannelNotFound,
            Self::NotMember(_) => ErrorCode::NotMember,
            Self::AlreadyMember(_) => ErrorCode::AlreadyMember,
            Self::DuplicateChannel(_) => ErrorCode::DuplicateChannel,
            Self::InsertFailed => ErrorCode::InsertFailed,
            Self::MessageNotFound(_) => ErrorCode::MessageNotFound,
            Self::EmptyChannel(_) => ErrorCode::EmptyChannel,
            Self::NicknameTooShort { .. } => ErrorCode::NicknameTooShort,
            Self::NicknameTooLong { .. } => ErrorCode::NicknameTooLong,
            Self::UserVanished => ErrorCode::UserVanished,
            Self::NotOwner => ErrorCode::NotOwner,
            Self::KeyUnavailable(_) => ErrorCode::KeyUnavailable,
            Self::KeyRefused(_) => ErrorCode::KeyRefused,
            Self::KeyTimeout(_) => ErrorCode::KeyTimeout,
            Self::InvalidKey(_) => ErrorCode::InvalidKey,
            Self::FileNotFound(_) => ErrorCode::FileNotFound,
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Refusal frame payload. Internal failures are logged here and never
    /// leak their detail to the client.
    pub fn to_refusal(&self) -> Refusal {
        if let Self::Internal(source) = self {
            error!("Internal error: {:#}", source);
        }
        Refusal::new(self.code(), self.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.into())
    }
}
