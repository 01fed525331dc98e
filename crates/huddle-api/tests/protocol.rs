use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use huddle_api::maintenance::{run_maintenance_loop, sweep};
use huddle_api::{AppState, AppStateInner, Notifier, Router, Settings, accounts, auth};
use huddle_gateway::{Flow, FrameHandler, Identity, Registry, Session};
use huddle_store::Store;
use huddle_types::events::ServerEvent;
use huddle_types::models::{Channel, Message, TOMBSTONE_SENDER, User, Visibility};

struct Harness {
    _dir: TempDir,
    state: AppState,
    router: Router,
}

struct Client {
    session: Session,
    rx: UnboundedReceiver<ServerEvent>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_notifier(Arc::new(Recorder::default())).await
    }

    async fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let settings = Settings {
            poll_interval: Duration::from_millis(20),
            key_exchange_timeout: Duration::from_millis(300),
            history_limit: 10,
            ..Settings::default()
        };
        let state = AppStateInner::with_notifier(store, Registry::new(), settings, notifier);
        Self {
            _dir: dir,
            router: Router::new(state.clone()),
            state,
        }
    }

    async fn connect(&self) -> Client {
        let (conn_id, rx) = self.state.registry.register_connection().await;
        Client {
            session: Session::new(conn_id),
            rx,
        }
    }

    /// Seed an account directly and log a fresh connection in as it,
    /// skipping password hashing.
    async fn user(&self, email: &str, nickname: &str) -> Client {
        let now = Utc::now();
        self.state
            .store
            .insert(User {
                email: email.into(),
                nickname: nickname.into(),
                password_hash: "unused".into(),
                channels: Default::default(),
                friends: Default::default(),
                last_seen: now,
                self_destruct_at: now + self.state.settings.inactivity,
                warned: false,
                public_key: None,
                invites: Vec::new(),
            })
            .await
            .unwrap();

        let mut client = self.connect().await;
        client.session.authenticate(email.into());
        self.state
            .registry
            .authenticate(
                client.session.conn_id(),
                Identity {
                    email: email.into(),
                    nickname: nickname.into(),
                },
            )
            .await;
        client
    }

    async fn send(&self, client: &mut Client, frame: Value) -> Flow {
        self.router
            .handle_frame(&mut client.session, &frame.to_string())
            .await
    }

    async fn load_user(&self, email: &str) -> Option<User> {
        self.state.store.query::<User>().by_key(email).first().await.unwrap()
    }

    async fn channel_exists(&self, id: &str) -> bool {
        self.state.store.query::<Channel>().by_key(id).exists().await.unwrap()
    }

    async fn create_channel(&self, owner: &mut Client, name: &str, visibility: &str) -> Channel {
        self.send(
            owner,
            json!({"command": "create_channel", "data": {"name": name, "visibility": visibility}}),
        )
        .await;
        match owner.next() {
            ServerEvent::ChannelCreated(channel) => channel,
            other => panic!("expected channel_created, got {other:?}"),
        }
    }
}

impl Client {
    fn next(&mut self) -> ServerEvent {
        self.rx.try_recv().expect("an event was queued")
    }

    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait(&mut self) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("event within timeout")
            .expect("queue open")
    }
}

fn code_of(event: &ServerEvent) -> u16 {
    let json = serde_json::to_value(event).unwrap();
    json["data"]["code"].as_u64().expect("refusal frame") as u16
}

fn tag_of(event: &ServerEvent) -> String {
    serde_json::to_value(event).unwrap()["command"]
        .as_str()
        .unwrap()
        .to_string()
}

#[derive(Default)]
struct Recorder {
    warned: Mutex<Vec<(String, DateTime<Utc>)>>,
    fail: bool,
}

impl Notifier for Recorder {
    fn warn_inactive(&self, user: &User, deletion_at: DateTime<Utc>) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("mail relay down");
        }
        self.warned.lock().unwrap().push((user.email.clone(), deletion_at));
        Ok(())
    }
}

// -- Authentication gate --

#[tokio::test]
async fn unauthenticated_connections_only_accept_login_and_signup() {
    let h = Harness::new().await;
    let mut c = h.connect().await;

    h.send(&mut c, json!({"command": "send_message", "data": {"channel": "x", "body": "hi"}}))
        .await;
    let event = c.next();
    assert_eq!(tag_of(&event), "error");
    assert_eq!(code_of(&event), 3);

    let flow = h
        .router
        .handle_frame(&mut c.session, "{not json")
        .await;
    assert_eq!(flow, Flow::Continue);
    assert_eq!(code_of(&c.next()), 2);
    assert!(c.session.email().is_none());
}

#[tokio::test]
async fn signup_login_and_refusal_codes() {
    let h = Harness::new().await;

    let mut a = h.connect().await;
    let signup = json!({"command": "signup_request",
        "data": {"email": "ana@example.com", "nickname": "ana", "password": "correct horse"}});
    h.send(&mut a, signup.clone()).await;
    assert!(matches!(a.next(), ServerEvent::SignupSuccess(p) if p.email == "ana@example.com"));
    assert_eq!(a.session.email(), Some("ana@example.com"));

    // Login again on an authenticated connection is not allowed.
    h.send(&mut a, json!({"command": "login_request",
        "data": {"email": "ana@example.com", "password": "correct horse"}}))
        .await;
    assert_eq!(code_of(&a.next()), 3);

    let mut b = h.connect().await;
    h.send(&mut b, signup).await;
    let event = b.next();
    assert_eq!(tag_of(&event), "signup_refused");
    assert_eq!(code_of(&event), 12);

    h.send(&mut b, json!({"command": "login_request",
        "data": {"email": "ana@example.com", "password": "wrong horse"}}))
        .await;
    let event = b.next();
    assert_eq!(tag_of(&event), "login_refused");
    assert_eq!(code_of(&event), 10);

    h.send(&mut b, json!({"command": "login_request",
        "data": {"email": "nobody@example.com", "password": "whatever1"}}))
        .await;
    assert_eq!(code_of(&b.next()), 11);
    assert!(b.session.email().is_none());

    h.send(&mut b, json!({"command": "login_request",
        "data": {"email": "ana@example.com", "password": "correct horse"}}))
        .await;
    assert!(matches!(b.next(), ServerEvent::LoginSuccess(_)));
}

// -- Nicknames --

#[tokio::test]
async fn nickname_length_is_enforced() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;

    for (nickname, expected) in [("ab", Some(50)), ("abcdefghijk", Some(51)), ("abc", None), ("abcdefghij", None)] {
        h.send(&mut a, json!({"command": "change_nickname", "data": {"nickname": nickname}}))
            .await;
        let event = a.next();
        match expected {
            Some(code) => {
                assert_eq!(tag_of(&event), "nickname_failed");
                assert_eq!(code_of(&event), code);
            }
            None => {
                assert_eq!(
                    event,
                    ServerEvent::NicknameChanged {
                        email: "ana@example.com".into(),
                        nickname: nickname.into()
                    }
                );
                assert_eq!(h.load_user("ana@example.com").await.unwrap().nickname, nickname);
            }
        }
    }
}

// -- Messaging --

async fn seed_messages(h: &Harness, channel: &str, sender: &str, at: &[i64]) -> Vec<Message> {
    let mut stored = Vec::new();
    for (i, secs) in at.iter().enumerate() {
        let mut message = Message::new(sender.into(), channel.into(), format!("m{i}"));
        message.timestamp = DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap();
        stored.push(h.state.store.insert(message).await.unwrap());
    }
    stored
}

#[tokio::test]
async fn history_returns_most_recent_ascending() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let channel = h.create_channel(&mut a, "general", "public").await;

    h.send(&mut a, json!({"command": "history_request", "data": {"channel": channel.id, "count": 3}}))
        .await;
    assert_eq!(code_of(&a.next()), 40);

    // Inserted out of order on purpose.
    seed_messages(&h, &channel.id, "ana@example.com", &[40, 0, 30, 10, 20]).await;

    h.send(&mut a, json!({"command": "history_request", "data": {"channel": channel.id, "count": 3}}))
        .await;
    match a.next() {
        ServerEvent::History { messages, .. } => {
            let secs: Vec<i64> = messages.iter().map(|m| m.timestamp.timestamp() - 1_700_000_000).collect();
            assert_eq!(secs, vec![20, 30, 40]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn history_above_the_limit_is_refused() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;
    let channel = h.create_channel(&mut a, "general", "public").await;
    let secs: Vec<i64> = (0..12).collect();
    seed_messages(&h, &channel.id, "ana@example.com", &secs).await;

    h.send(&mut a, json!({"command": "history_request", "data": {"channel": channel.id, "count": 10}}))
        .await;
    match a.next() {
        ServerEvent::History { messages, .. } => assert_eq!(messages.len(), 10),
        other => panic!("unexpected {other:?}"),
    }

    h.send(&mut a, json!({"command": "history_request", "data": {"channel": channel.id, "count": 11}}))
        .await;
    let event = a.next();
    assert_eq!(tag_of(&event), "history_failed");
    assert_eq!(code_of(&event), 81);

    // Refused before the membership is recorded.
    h.send(&mut b, json!({"command": "join_channel", "data": {"channel": channel.id, "history": 11}}))
        .await;
    let event = b.next();
    assert_eq!(tag_of(&event), "join_failed");
    assert_eq!(code_of(&event), 81);
    assert!(!h.load_user("bo@example.com").await.unwrap().channels.contains(&channel.id));
}

#[tokio::test]
async fn lookup_finds_nearest_message_in_local_time() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let channel = h.create_channel(&mut a, "general", "public").await;
    seed_messages(&h, &channel.id, "ana@example.com", &[0, 10, 20]).await;

    // 12s past the first message, expressed at UTC+02:00.
    let local = (DateTime::from_timestamp(1_700_000_012, 0).unwrap() + chrono::Duration::hours(2)).naive_utc();
    h.send(&mut a, json!({"command": "lookup_request",
        "data": {"channel": channel.id, "local_time": local, "utc_offset_minutes": 120}}))
        .await;
    match a.next() {
        ServerEvent::LookupResult { messages, index, .. } => {
            assert_eq!(messages.len(), 3);
            assert_eq!(index, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn messages_reach_viewers_but_not_outsiders() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;
    let mut outsider = h.user("cy@example.com", "cy").await;
    let channel = h.create_channel(&mut a, "general", "public").await;

    h.send(&mut b, json!({"command": "join_channel", "data": {"channel": channel.id}}))
        .await;
    assert!(matches!(b.next(), ServerEvent::JoinComplete { .. }));

    h.send(&mut a, json!({"command": "send_message", "data": {"channel": channel.id, "body": "hello"}}))
        .await;
    assert!(matches!(a.next(), ServerEvent::MessageReceived(m) if m.body == "hello"));
    assert!(matches!(b.next(), ServerEvent::MessageReceived(m) if m.sender == "ana@example.com"));
    assert!(outsider.drain().is_empty());

    h.send(&mut outsider, json!({"command": "send_message", "data": {"channel": channel.id, "body": "psst"}}))
        .await;
    let event = outsider.next();
    assert_eq!(tag_of(&event), "message_failed");
    assert_eq!(code_of(&event), 21);
}

// -- Channels --

#[tokio::test]
async fn leaving_a_channel_without_live_messages_removes_it() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;
    let channel = h.create_channel(&mut a, "general", "public").await;

    h.send(&mut b, json!({"command": "join_channel", "data": {"channel": channel.id}}))
        .await;
    b.drain();
    h.send(&mut b, json!({"command": "join_channel", "data": {"channel": channel.id}}))
        .await;
    assert_eq!(code_of(&b.next()), 22);

    // Ana is still a member, but nobody ever said anything.
    h.send(&mut b, json!({"command": "leave_channel", "data": {"channel": channel.id}}))
        .await;
    assert!(matches!(b.next(), ServerEvent::LeaveComplete { deleted: true, .. }));
    assert!(!h.channel_exists(&channel.id).await);
    assert!(!h.load_user("ana@example.com").await.unwrap().channels.contains(&channel.id));
}

#[tokio::test]
async fn live_messages_keep_a_channel_after_members_leave() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;
    let channel = h.create_channel(&mut a, "general", "public").await;
    h.send(&mut b, json!({"command": "join_channel", "data": {"channel": channel.id}}))
        .await;
    b.drain();
    seed_messages(&h, &channel.id, "bo@example.com", &[0]).await;

    h.send(&mut a, json!({"command": "leave_channel", "data": {"channel": channel.id}}))
        .await;
    assert!(matches!(a.next(), ServerEvent::LeaveComplete { deleted: false, .. }));
    h.send(&mut b, json!({"command": "leave_channel", "data": {"channel": channel.id}}))
        .await;
    assert!(matches!(b.next(), ServerEvent::LeaveComplete { deleted: false, .. }));
    assert!(h.channel_exists(&channel.id).await);
}

#[tokio::test]
async fn duplicate_channel_names_are_refused() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    h.create_channel(&mut a, "General", "public").await;

    h.send(&mut a, json!({"command": "create_channel", "data": {"name": "general", "visibility": "private"}}))
        .await;
    let event = a.next();
    assert_eq!(tag_of(&event), "create_failed");
    assert_eq!(code_of(&event), 23);
}

#[tokio::test]
async fn deleting_last_live_message_removes_channel_for_its_members() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let channel = h.create_channel(&mut a, "general", "public").await;
    let messages = seed_messages(&h, &channel.id, "ana@example.com", &[0, 10]).await;

    h.send(&mut a, json!({"command": "delete_message",
        "data": {"channel": channel.id, "message_id": messages[0].id}}))
        .await;
    assert!(matches!(a.next(), ServerEvent::MessageDeleted { .. }));
    assert!(h.channel_exists(&channel.id).await);

    h.send(&mut a, json!({"command": "delete_message",
        "data": {"channel": channel.id, "message_id": messages[1].id}}))
        .await;
    assert!(matches!(a.next(), ServerEvent::MessageDeleted { .. }));
    assert!(!h.channel_exists(&channel.id).await);
    assert!(!h.load_user("ana@example.com").await.unwrap().channels.contains(&channel.id));
}

#[tokio::test]
async fn only_the_sender_may_delete_a_message() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;
    let channel = h.create_channel(&mut a, "general", "public").await;
    let messages = seed_messages(&h, &channel.id, "ana@example.com", &[0]).await;

    h.send(&mut b, json!({"command": "delete_message",
        "data": {"channel": channel.id, "message_id": messages[0].id}}))
        .await;
    let event = b.next();
    assert_eq!(tag_of(&event), "delete_message_failed");
    assert_eq!(code_of(&event), 60);
}

#[tokio::test]
async fn open_channel_pushes_participants_until_closed() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let channel = h.create_channel(&mut a, "general", "public").await;

    h.send(&mut a, json!({"command": "channel_open", "data": {"channel": channel.id}}))
        .await;
    match a.wait().await {
        ServerEvent::Participants { users, .. } => {
            assert_eq!(users.len(), 1);
            assert!(users[0].online);
        }
        other => panic!("unexpected {other:?}"),
    }

    h.send(&mut a, json!({"command": "channel_close", "data": {"channel": channel.id}}))
        .await;
    assert_eq!(a.session.polling_channel(), None);
    tokio::time::sleep(Duration::from_millis(60)).await;
    a.drain();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(a.drain().is_empty());
}

// -- Accounts --

#[tokio::test]
async fn removed_user_leaves_tombstoned_messages() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;
    let channel = h.create_channel(&mut a, "general", "public").await;
    h.send(&mut b, json!({"command": "join_channel", "data": {"channel": channel.id}}))
        .await;
    seed_messages(&h, &channel.id, "ana@example.com", &[0, 10]).await;
    seed_messages(&h, &channel.id, "bo@example.com", &[20]).await;
    accounts::make_friends(&h.state, "ana@example.com", "bo@example.com")
        .await
        .unwrap();

    assert!(accounts::remove_user(&h.state, "ana@example.com").await.unwrap());

    assert!(h.load_user("ana@example.com").await.is_none());
    let remaining = h
        .state
        .store
        .query::<Message>()
        .within(channel.id.as_str())
        .results()
        .await
        .unwrap();
    assert_eq!(remaining.len(), 3);
    assert_eq!(remaining.iter().filter(|m| m.sender == TOMBSTONE_SENDER).count(), 2);
    assert!(h.load_user("bo@example.com").await.unwrap().friends.is_empty());
    // Bo's message is still live.
    assert!(h.channel_exists(&channel.id).await);

    assert!(!accounts::remove_user(&h.state, "ana@example.com").await.unwrap());
}

#[tokio::test]
async fn removing_sole_author_prunes_memberless_channel() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let channel = h.create_channel(&mut a, "general", "public").await;
    seed_messages(&h, &channel.id, "ana@example.com", &[0]).await;

    accounts::remove_user(&h.state, "ana@example.com").await.unwrap();
    assert!(!h.channel_exists(&channel.id).await);
}

#[tokio::test]
async fn delete_account_requires_own_identity_and_closes() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    h.user("bo@example.com", "bo").await;

    h.send(&mut a, json!({"command": "delete_account", "data": {"email": "bo@example.com"}}))
        .await;
    assert_eq!(code_of(&a.next()), 60);
    assert!(h.load_user("bo@example.com").await.is_some());

    let flow = h
        .send(&mut a, json!({"command": "delete_account", "data": {"email": "ana@example.com"}}))
        .await;
    assert_eq!(flow, Flow::Close);
    assert_eq!(a.next(), ServerEvent::AccountDeleted);
    assert!(a.session.is_closed());
    assert!(h.load_user("ana@example.com").await.is_none());
}

#[tokio::test]
async fn friendship_is_symmetric() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;

    h.send(&mut a, json!({"command": "friend_add", "data": {"email": "bo@example.com"}}))
        .await;
    assert_eq!(
        a.next(),
        ServerEvent::FriendUpdated {
            email: "bo@example.com".into(),
            friends: true
        }
    );
    assert!(matches!(b.next(), ServerEvent::FriendUpdated { friends: true, .. }));
    assert!(accounts::check_friends(&h.state, "ana@example.com", "bo@example.com").await.unwrap());
    assert!(accounts::check_friends(&h.state, "bo@example.com", "ana@example.com").await.unwrap());

    h.send(&mut b, json!({"command": "friend_remove", "data": {"email": "ana@example.com"}}))
        .await;
    assert!(matches!(b.next(), ServerEvent::FriendUpdated { friends: false, .. }));
    assert_eq!(
        a.next(),
        ServerEvent::FriendUpdated {
            email: "bo@example.com".into(),
            friends: false
        }
    );
    assert!(!accounts::check_friends(&h.state, "ana@example.com", "bo@example.com").await.unwrap());
    assert!(!accounts::check_friends(&h.state, "bo@example.com", "ana@example.com").await.unwrap());

    h.send(&mut a, json!({"command": "friend_add", "data": {"email": "ghost@example.com"}}))
        .await;
    let event = a.next();
    assert_eq!(tag_of(&event), "friend_failed");
    assert_eq!(code_of(&event), 11);
}

#[tokio::test]
async fn touch_never_moves_last_seen_backwards() {
    let h = Harness::new().await;
    h.user("ana@example.com", "ana").await;
    let before = h.load_user("ana@example.com").await.unwrap();

    h.state
        .store
        .query::<User>()
        .by_key("ana@example.com")
        .update(|u| u.warned = true)
        .await
        .unwrap();

    let earlier = before.last_seen - chrono::Duration::hours(1);
    let touched = auth::touch_user(&h.state, "ana@example.com", earlier)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(touched.last_seen, before.last_seen);
    assert_eq!(touched.self_destruct_at, before.last_seen + h.state.settings.inactivity);
    assert!(!touched.warned);

    let later = before.last_seen + chrono::Duration::hours(1);
    let touched = auth::touch_user(&h.state, "ana@example.com", later)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(touched.last_seen, later);
    assert_eq!(touched.self_destruct_at, later + h.state.settings.inactivity);

    assert!(auth::touch_user(&h.state, "nobody@example.com", later).await.unwrap().is_none());
}

// -- Inactivity sweep --

#[tokio::test]
async fn sweep_warns_then_deletes() {
    let recorder = Arc::new(Recorder::default());
    let h = Harness::with_notifier(recorder.clone()).await;
    h.user("soon@example.com", "soon").await;
    h.user("gone@example.com", "gone").await;
    h.user("fine@example.com", "fine").await;

    let now = Utc::now();
    h.state
        .store
        .query::<User>()
        .by_key("soon@example.com")
        .update(move |u| u.self_destruct_at = now + chrono::Duration::days(5))
        .await
        .unwrap();
    h.state
        .store
        .query::<User>()
        .by_key("gone@example.com")
        .update(move |u| {
            u.self_destruct_at = now - chrono::Duration::hours(1);
            u.warned = true;
        })
        .await
        .unwrap();

    let report = sweep(&h.state, now).await.unwrap();
    assert_eq!(report.warned, vec!["soon@example.com".to_string()]);
    assert_eq!(report.deleted, vec!["gone@example.com".to_string()]);

    let soon = h.load_user("soon@example.com").await.unwrap();
    assert!(soon.warned);
    assert_eq!(soon.self_destruct_at, now + chrono::Duration::days(7));
    assert!(h.load_user("gone@example.com").await.is_none());
    assert!(!h.load_user("fine@example.com").await.unwrap().warned);

    let warned = recorder.warned.lock().unwrap().clone();
    assert_eq!(warned, vec![("soon@example.com".to_string(), now + chrono::Duration::days(7))]);

    // A warned user is not warned twice.
    let report = sweep(&h.state, now).await.unwrap();
    assert!(report.warned.is_empty());
}

#[tokio::test]
async fn failed_notification_leaves_user_unwarned() {
    let recorder = Arc::new(Recorder {
        fail: true,
        ..Default::default()
    });
    let h = Harness::with_notifier(recorder).await;
    h.user("soon@example.com", "soon").await;

    let now = Utc::now();
    let deadline = now + chrono::Duration::days(2);
    h.state
        .store
        .query::<User>()
        .by_key("soon@example.com")
        .update(move |u| u.self_destruct_at = deadline)
        .await
        .unwrap();

    let report = sweep(&h.state, now).await.unwrap();
    assert!(report.warned.is_empty());
    let soon = h.load_user("soon@example.com").await.unwrap();
    assert!(!soon.warned);
    assert_eq!(soon.self_destruct_at, deadline);
}

#[tokio::test]
async fn maintenance_loop_stops_on_shutdown_after_its_sweep() {
    let h = Harness::new().await;
    h.user("gone@example.com", "gone").await;
    h.state
        .store
        .query::<User>()
        .by_key("gone@example.com")
        .update(|u| {
            u.self_destruct_at = Utc::now() - chrono::Duration::hours(1);
            u.warned = true;
        })
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(run_maintenance_loop(
        h.state.clone(),
        Duration::from_secs(3600),
        shutdown.clone(),
    ));

    // The first tick fires at once and its sweep runs to completion.
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.load_user("gone@example.com").await.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first sweep ran");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("loop returned after cancellation")
        .expect("loop did not panic");
}

// -- Keys and invites --

#[tokio::test]
async fn private_channel_join_needs_an_invite() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;
    let channel = h.create_channel(&mut a, "secret", "private").await;
    assert_eq!(channel.visibility, Visibility::Private);

    h.send(&mut b, json!({"command": "join_channel", "data": {"channel": channel.id}}))
        .await;
    assert_eq!(code_of(&b.next()), 21);

    let invite = json!({"command": "invite_user",
        "data": {"channel": channel.id, "invitee": "bo@example.com", "encrypted_secret": "c2VjcmV0"}});
    h.send(&mut a, invite.clone()).await;
    let event = a.next();
    assert_eq!(tag_of(&event), "invite_failed");
    assert_eq!(code_of(&event), 70);

    h.send(&mut b, json!({"command": "publish_public_key", "data": {"public_key": "AAECAwQF"}}))
        .await;
    assert_eq!(b.next(), ServerEvent::PublicKeyRegistered);

    h.send(&mut a, invite).await;
    assert!(matches!(a.next(), ServerEvent::InviteSent { .. }));
    assert!(matches!(b.next(), ServerEvent::InviteReceived(i) if i.from == "ana@example.com"));

    h.send(&mut b, json!({"command": "join_channel", "data": {"channel": channel.id, "history": 10}}))
        .await;
    match b.next() {
        ServerEvent::JoinComplete {
            channel: joined,
            encrypted_secret,
            ..
        } => {
            assert_eq!(joined.id, channel.id);
            assert_eq!(encrypted_secret.as_deref(), Some("c2VjcmV0"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.load_user("bo@example.com").await.unwrap().invites.is_empty());
}

#[tokio::test]
async fn stored_key_is_returned_immediately() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;

    h.send(&mut b, json!({"command": "publish_public_key", "data": {"public_key": "AAECAwQF"}}))
        .await;
    b.drain();

    h.send(&mut a, json!({"command": "public_key_request", "data": {"target": "bo@example.com"}}))
        .await;
    assert_eq!(
        a.next(),
        ServerEvent::PublicKeyResponse {
            target: "bo@example.com".into(),
            public_key: "AAECAwQF".into()
        }
    );

    h.send(&mut b, json!({"command": "publish_public_key", "data": {"public_key": "%%%"}}))
        .await;
    assert_eq!(code_of(&b.next()), 73);
}

#[tokio::test]
async fn key_request_is_relayed_to_an_online_peer() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;

    h.send(&mut a, json!({"command": "public_key_request", "data": {"target": "bo@example.com"}}))
        .await;
    let request_id = match b.next() {
        ServerEvent::PublicKeyRequested { request_id, from } => {
            assert_eq!(from, "ana@example.com");
            request_id
        }
        other => panic!("unexpected {other:?}"),
    };

    // Only the addressed peer may answer.
    h.send(&mut a, json!({"command": "public_key_reply",
        "data": {"request_id": request_id, "public_key": "AAECAwQF"}}))
        .await;
    assert_eq!(code_of(&a.next()), 70);

    h.send(&mut b, json!({"command": "public_key_reply",
        "data": {"request_id": request_id, "public_key": "AAECAwQF"}}))
        .await;
    assert_eq!(
        a.wait().await,
        ServerEvent::PublicKeyResponse {
            target: "bo@example.com".into(),
            public_key: "AAECAwQF".into()
        }
    );
}

#[tokio::test]
async fn unanswered_key_request_times_out() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut b = h.user("bo@example.com", "bo").await;

    h.send(&mut a, json!({"command": "public_key_request", "data": {"target": "bo@example.com"}}))
        .await;
    assert!(matches!(b.next(), ServerEvent::PublicKeyRequested { .. }));

    let event = a.wait().await;
    assert_eq!(tag_of(&event), "public_key_failed");
    assert_eq!(code_of(&event), 72);
}

#[tokio::test]
async fn offline_peer_without_key_is_unavailable() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let b = h.user("bo@example.com", "bo").await;
    h.state.registry.unregister_connection(b.session.conn_id()).await;

    h.send(&mut a, json!({"command": "public_key_request", "data": {"target": "bo@example.com"}}))
        .await;
    assert_eq!(code_of(&a.next()), 70);
}

// -- Files --

#[tokio::test]
async fn uploaded_file_can_be_downloaded_by_members() {
    let h = Harness::new().await;
    let mut a = h.user("ana@example.com", "ana").await;
    let mut outsider = h.user("cy@example.com", "cy").await;
    let channel = h.create_channel(&mut a, "general", "public").await;

    h.send(&mut a, json!({"command": "file_upload", "data": {
        "channel": channel.id, "file_name": "hello.txt", "payload": "aGVsbG8=", "encoding": "raw"}}))
        .await;
    let id = match a.next() {
        ServerEvent::FileStored { id, sha256 } => {
            assert_eq!(sha256, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
            id
        }
        other => panic!("unexpected {other:?}"),
    };

    h.send(&mut a, json!({"command": "file_download", "data": {"file_id": id}}))
        .await;
    assert!(matches!(a.next(), ServerEvent::FileData(f) if f.payload == "aGVsbG8=" && f.file_name == "hello.txt"));

    h.send(&mut outsider, json!({"command": "file_download", "data": {"file_id": id}}))
        .await;
    assert_eq!(code_of(&outsider.next()), 21);

    h.send(&mut a, json!({"command": "file_download", "data": {"file_id": "missing"}}))
        .await;
    assert_eq!(code_of(&a.next()), 80);
}
