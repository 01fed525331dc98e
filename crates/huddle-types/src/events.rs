use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codes::ErrorCode;
use crate::models::{Channel, Encoding, FileAttachment, Invite, Message, Visibility};

/// Commands sent FROM client TO server. One JSON object per frame:
/// `{"command": "<tag>", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    LoginRequest {
        email: String,
        password: String,
    },
    SignupRequest {
        email: String,
        nickname: String,
        password: String,
    },

    SendMessage {
        channel: String,
        body: String,
    },
    HistoryRequest {
        channel: String,
        count: usize,
    },
    /// Find the message closest to a wall-clock time in the client's zone.
    LookupRequest {
        channel: String,
        local_time: NaiveDateTime,
        #[serde(default)]
        utc_offset_minutes: i32,
    },
    DeleteMessage {
        channel: String,
        message_id: String,
    },

    JoinChannel {
        channel: String,
        /// Number of recent messages to return with the completion frame.
        #[serde(default)]
        history: Option<usize>,
    },
    LeaveChannel {
        channel: String,
    },
    CreateChannel {
        name: String,
        visibility: Visibility,
    },
    ListChannels,
    /// Client started viewing a channel.
    ChannelOpen {
        channel: String,
    },
    /// Client stopped viewing a channel.
    ChannelClose {
        channel: String,
    },
    ParticipantsRequest {
        channel: String,
    },

    ChangeNickname {
        nickname: String,
    },
    DeleteAccount {
        email: String,
    },

    PublishPublicKey {
        public_key: String,
    },
    PublicKeyRequest {
        target: String,
    },
    /// Answer to a `public_key_requested` event. `None` refuses.
    PublicKeyReply {
        request_id: Uuid,
        #[serde(default)]
        public_key: Option<String>,
    },
    InviteUser {
        channel: String,
        invitee: String,
        encrypted_secret: String,
    },
    ListInvites,

    FileUpload {
        channel: String,
        file_name: String,
        payload: String,
        encoding: Encoding,
        #[serde(default)]
        key_material: Option<String>,
    },
    FileDownload {
        file_id: String,
    },

    FriendAdd {
        email: String,
    },
    FriendRemove {
        email: String,
    },
    FriendList,
}

impl ClientCommand {
    /// Wire tag, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoginRequest { .. } => "login_request",
            Self::SignupRequest { .. } => "signup_request",
            Self::SendMessage { .. } => "send_message",
            Self::HistoryRequest { .. } => "history_request",
            Self::LookupRequest { .. } => "lookup_request",
            Self::DeleteMessage { .. } => "delete_message",
            Self::JoinChannel { .. } => "join_channel",
            Self::LeaveChannel { .. } => "leave_channel",
            Self::CreateChannel { .. } => "create_channel",
            Self::ListChannels => "list_channels",
            Self::ChannelOpen { .. } => "channel_open",
            Self::ChannelClose { .. } => "channel_close",
            Self::ParticipantsRequest { .. } => "participants_request",
            Self::ChangeNickname { .. } => "change_nickname",
            Self::DeleteAccount { .. } => "delete_account",
            Self::PublishPublicKey { .. } => "publish_public_key",
            Self::PublicKeyRequest { .. } => "public_key_request",
            Self::PublicKeyReply { .. } => "public_key_reply",
            Self::InviteUser { .. } => "invite_user",
            Self::ListInvites => "list_invites",
            Self::FileUpload { .. } => "file_upload",
            Self::FileDownload { .. } => "file_download",
            Self::FriendAdd { .. } => "friend_add",
            Self::FriendRemove { .. } => "friend_remove",
            Self::FriendList => "friend_list",
        }
    }

    /// Only login and signup are accepted before authentication.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::LoginRequest { .. } | Self::SignupRequest { .. })
    }
}

/// Payload of every refusal frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refusal {
    pub code: u16,
    pub reason: String,
}

impl Refusal {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            reason: reason.into(),
        }
    }
}

/// Public view of an account returned on login/signup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub email: String,
    pub nickname: String,
    pub channels: Vec<String>,
    pub friends: Vec<String>,
    pub pending_invites: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub email: String,
    pub nickname: String,
    pub online: bool,
}

/// File metadata broadcast to a channel; the payload is fetched on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub file_name: String,
    pub encoding: Encoding,
    pub sha256: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&FileAttachment> for FileMeta {
    fn from(file: &FileAttachment) -> Self {
        Self {
            id: file.id.clone(),
            channel: file.channel.clone(),
            sender: file.sender.clone(),
            file_name: file.file_name.clone(),
            encoding: file.encoding,
            sha256: file.sha256.clone(),
            timestamp: file.timestamp,
        }
    }
}

/// Events sent FROM server TO client. Success and refusal use distinct tags
/// per request kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    LoginSuccess(Profile),
    LoginRefused(Refusal),
    SignupSuccess(Profile),
    SignupRefused(Refusal),

    /// Generic parsing, permission or internal failure.
    Error(Refusal),

    MessageReceived(Message),
    MessageFailed(Refusal),
    MessageDeleted {
        channel: String,
        message_id: String,
    },
    DeleteMessageFailed(Refusal),
    History {
        channel: String,
        messages: Vec<Message>,
    },
    HistoryFailed(Refusal),
    LookupResult {
        channel: String,
        messages: Vec<Message>,
        index: usize,
    },
    LookupFailed(Refusal),

    JoinComplete {
        channel: Channel,
        history: Vec<Message>,
        encrypted_secret: Option<String>,
    },
    JoinFailed(Refusal),
    LeaveComplete {
        channel: String,
        deleted: bool,
    },
    LeaveFailed(Refusal),
    ChannelCreated(Channel),
    CreateFailed(Refusal),
    ChannelList {
        joined: Vec<Channel>,
        public: Vec<Channel>,
    },
    ChannelListFailed(Refusal),
    Participants {
        channel: String,
        users: Vec<Participant>,
    },
    ParticipantsFailed(Refusal),

    NicknameChanged {
        email: String,
        nickname: String,
    },
    NicknameFailed(Refusal),
    AccountDeleted,
    DeleteFailed(Refusal),

    PublicKeyRegistered,
    PublishKeyFailed(Refusal),
    /// Sent to a peer asked to hand out its public key.
    PublicKeyRequested {
        request_id: Uuid,
        from: String,
    },
    PublicKeyResponse {
        target: String,
        public_key: String,
    },
    PublicKeyFailed(Refusal),
    InviteSent {
        channel: String,
        invitee: String,
    },
    InviteFailed(Refusal),
    InviteReceived(Invite),
    InviteList {
        invites: Vec<Invite>,
    },

    FileStored {
        id: String,
        sha256: String,
    },
    FileReceived(FileMeta),
    FileData(FileAttachment),
    FileFailed(Refusal),

    FriendUpdated {
        email: String,
        friends: bool,
    },
    FriendList {
        friends: Vec<String>,
    },
    FriendFailed(Refusal),
}
