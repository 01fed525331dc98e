use std::future::Future;

use chrono::Utc;
use tracing::{debug, warn};

use huddle_gateway::{Flow, FrameHandler, Session};
use huddle_types::codes::ErrorCode;
use huddle_types::events::{ClientCommand, Refusal, ServerEvent};
use huddle_types::models::User;

use crate::error::{ApiError, ApiResult};
use crate::files::Upload;
use crate::state::AppState;
use crate::{accounts, auth, channels, files, keys, messages};

/// Protocol state machine for one connection at a time. Decodes each frame,
/// enforces the authentication gate, and dispatches to exactly one handler.
#[derive(Clone)]
pub struct Router {
    state: AppState,
}

impl Router {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    async fn reply(&self, session: &Session, event: ServerEvent) {
        self.state.registry.send_to_conn(session.conn_id(), event).await;
    }

    async fn dispatch(&self, session: &mut Session, text: &str) -> Flow {
        if session.is_closed() {
            return Flow::Close;
        }

        let command: ClientCommand = match serde_json::from_str(text) {
            Ok(command) => command,
            Err(e) => {
                debug!("Undecodable frame on {}: {}", session.conn_id(), e);
                let refusal = ApiError::Parsing(e.to_string()).to_refusal();
                self.reply(session, ServerEvent::Error(refusal)).await;
                return Flow::Continue;
            }
        };

        match (session.email().is_some(), command.requires_auth()) {
            (false, true) => {
                self.reply(session, ServerEvent::Error(ApiError::Permission.to_refusal()))
                    .await;
                return Flow::Continue;
            }
            (true, false) => {
                let refusal = Refusal::new(ErrorCode::Permission, "already authenticated");
                self.reply(session, ServerEvent::Error(refusal)).await;
                return Flow::Continue;
            }
            _ => {}
        }

        let name = command.name();
        let refuse = refusal_event(&command);
        match self.route(session, command).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!("{} refused on {}: {}", name, session.conn_id(), e);
                self.reply(session, refuse(e.to_refusal())).await;
                Flow::Continue
            }
        }
    }

    async fn route(&self, session: &mut Session, command: ClientCommand) -> ApiResult<Flow> {
        let state = &self.state;

        let command = match command {
            ClientCommand::LoginRequest { email, password } => {
                auth::login(state, session, email, password).await?;
                return Ok(Flow::Continue);
            }
            ClientCommand::SignupRequest {
                email,
                nickname,
                password,
            } => {
                auth::signup(state, session, email, nickname, password).await?;
                return Ok(Flow::Continue);
            }
            other => other,
        };
        let user = self.current_user(session).await?;

        match command {
            ClientCommand::LoginRequest { .. } | ClientCommand::SignupRequest { .. } => {}

            ClientCommand::SendMessage { channel, body } => {
                messages::send(state, session, &user, channel, body).await?
            }
            ClientCommand::HistoryRequest { channel, count } => {
                messages::history(state, session, &user, channel, count).await?
            }
            ClientCommand::LookupRequest {
                channel,
                local_time,
                utc_offset_minutes,
            } => messages::lookup(state, session, &user, channel, local_time, utc_offset_minutes).await?,
            ClientCommand::DeleteMessage { channel, message_id } => {
                messages::delete(state, session, &user, channel, message_id).await?
            }

            ClientCommand::JoinChannel { channel, history } => {
                channels::join(state, session, &user, channel, history).await?
            }
            ClientCommand::LeaveChannel { channel } => channels::leave(state, session, &user, channel).await?,
            ClientCommand::CreateChannel { name, visibility } => {
                channels::create(state, session, &user, name, visibility).await?
            }
            ClientCommand::ListChannels => channels::list(state, session, &user).await?,
            ClientCommand::ChannelOpen { channel } => channels::open(state, session, &user, channel).await?,
            ClientCommand::ChannelClose { channel } => channels::close(state, session, channel).await,
            ClientCommand::ParticipantsRequest { channel } => {
                channels::participants_request(state, session, &user, channel).await?
            }

            ClientCommand::ChangeNickname { nickname } => {
                accounts::change_nickname(state, &user, nickname).await?
            }
            ClientCommand::DeleteAccount { email } => {
                return accounts::delete_account(state, session, &user, email).await;
            }

            ClientCommand::PublishPublicKey { public_key } => {
                keys::publish(state, session, &user, public_key).await?
            }
            ClientCommand::PublicKeyRequest { target } => keys::request(state, session, &user, target).await?,
            ClientCommand::PublicKeyReply {
                request_id,
                public_key,
            } => keys::reply(state, &user, request_id, public_key).await?,
            ClientCommand::InviteUser {
                channel,
                invitee,
                encrypted_secret,
            } => keys::invite(state, session, &user, channel, invitee, encrypted_secret).await?,
            ClientCommand::ListInvites => keys::list_invites(state, session, &user).await?,

            ClientCommand::FileUpload {
                channel,
                file_name,
                payload,
                encoding,
                key_material,
            } => {
                let upload = Upload {
                    channel,
                    file_name,
                    payload,
                    encoding,
                    key_material,
                };
                files::upload(state, session, &user, upload).await?
            }
            ClientCommand::FileDownload { file_id } => files::download(state, session, &user, file_id).await?,

            ClientCommand::FriendAdd { email } => accounts::friend_add(state, session, &user, email).await?,
            ClientCommand::FriendRemove { email } => {
                accounts::friend_remove(state, session, &user, email).await?
            }
            ClientCommand::FriendList => accounts::friend_list(state, session, &user).await?,
        }
        Ok(Flow::Continue)
    }

    /// Fresh copy of the authenticated user's row.
    async fn current_user(&self, session: &Session) -> ApiResult<User> {
        let email = session.email().ok_or(ApiError::Permission)?;
        self.state
            .store
            .query::<User>()
            .by_key(email)
            .first()
            .await?
            .ok_or(ApiError::UserVanished)
    }
}

/// Which refusal frame answers a failed command.
fn refusal_event(command: &ClientCommand) -> fn(Refusal) -> ServerEvent {
    match command {
        ClientCommand::LoginRequest { .. } => ServerEvent::LoginRefused,
        ClientCommand::SignupRequest { .. } => ServerEvent::SignupRefused,
        ClientCommand::SendMessage { .. } => ServerEvent::MessageFailed,
        ClientCommand::HistoryRequest { .. } => ServerEvent::HistoryFailed,
        ClientCommand::LookupRequest { .. } => ServerEvent::LookupFailed,
        ClientCommand::DeleteMessage { .. } => ServerEvent::DeleteMessageFailed,
        ClientCommand::JoinChannel { .. } => ServerEvent::JoinFailed,
        ClientCommand::LeaveChannel { .. } => ServerEvent::LeaveFailed,
        ClientCommand::CreateChannel { .. } => ServerEvent::CreateFailed,
        ClientCommand::ListChannels => ServerEvent::ChannelListFailed,
        ClientCommand::ChannelOpen { .. } | ClientCommand::ChannelClose { .. } => ServerEvent::Error,
        ClientCommand::ParticipantsRequest { .. } => ServerEvent::ParticipantsFailed,
        ClientCommand::ChangeNickname { .. } => ServerEvent::NicknameFailed,
        ClientCommand::DeleteAccount { .. } => ServerEvent::DeleteFailed,
        ClientCommand::PublishPublicKey { .. } => ServerEvent::PublishKeyFailed,
        ClientCommand::PublicKeyRequest { .. } | ClientCommand::PublicKeyReply { .. } => {
            ServerEvent::PublicKeyFailed
        }
        ClientCommand::InviteUser { .. } | ClientCommand::ListInvites => ServerEvent::InviteFailed,
        ClientCommand::FileUpload { .. } | ClientCommand::FileDownload { .. } => ServerEvent::FileFailed,
        ClientCommand::FriendAdd { .. } | ClientCommand::FriendRemove { .. } | ClientCommand::FriendList => {
            ServerEvent::FriendFailed
        }
    }
}

impl FrameHandler for Router {
    fn handle_frame<'a>(
        &'a self,
        session: &'a mut Session,
        text: &'a str,
    ) -> impl Future<Output = Flow> + Send + 'a {
        self.dispatch(session, text)
    }

    fn handle_heartbeat<'a>(&'a self, session: &'a Session) -> impl Future<Output = ()> + Send + 'a {
        async move {
            let Some(email) = session.email() else {
                return;
            };
            if let Err(e) = auth::touch_user(&self.state, email, Utc::now()).await {
                warn!("Heartbeat for {} not recorded: {}", email, e);
            }
        }
    }

    fn handle_close<'a>(&'a self, session: &'a mut Session) -> impl Future<Output = ()> + Send + 'a {
        async move {
            session.stop_polling(None);
            if let Some(email) = session.email() {
                // The account may already be gone after a self-deletion.
                if let Err(e) = auth::touch_user(&self.state, email, Utc::now()).await {
                    warn!("Last-seen for {} not recorded: {}", email, e);
                }
            }
            session.close();
        }
    }
}
