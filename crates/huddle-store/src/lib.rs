//! File-backed document store.
//!
//! Each table is one JSON array on disk. Indexed tables are split into
//! partition files under a directory named after the table:
//!
//! ```text
//! {root}/channels.json
//! {root}/files.json
//! {root}/users/{first char}.json
//! {root}/messages/{channel id}.json
//! ```
//!
//! Writes always rewrite a whole file while holding that file's lock marker.

pub mod error;
pub mod lock;
pub mod query;
pub mod table;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::info;

pub use error::{Result, StoreError};
pub use lock::LockPolicy;
pub use query::Query;
pub use table::{IndexKey, Record, Table, TableSpec};

use crate::lock::TableLock;
use crate::table::sanitize_partition;

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: PathBuf,
    lock_policy: LockPolicy,
}

impl Store {
    pub async fn open(root: &Path) -> Result<Self> {
        Self::open_with(root, LockPolicy::default()).await
    }

    pub async fn open_with(root: &Path, lock_policy: LockPolicy) -> Result<Self> {
        fs::create_dir_all(root).await?;
        for table in [Table::Users, Table::Channels, Table::Messages, Table::Files] {
            if table.spec().is_indexed() {
                fs::create_dir_all(root.join(table.spec().name)).await?;
            }
        }

        info!("Document store opened at {}", root.display());
        Ok(Self {
            inner: Arc::new(StoreInner {
                root: root.to_path_buf(),
                lock_policy,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn table(kind: Table) -> TableSpec {
        kind.spec()
    }

    /// Start a read cursor over the table holding `R`.
    pub fn query<R: Record>(&self) -> Query<R> {
        Query::new(self.clone())
    }

    /// Append one record to its collection file.
    pub async fn insert<R: Record>(&self, record: R) -> Result<R> {
        let path = self.file_path(R::TABLE, record.partition().as_deref());
        let lock = TableLock::acquire(&path, &self.inner.lock_policy).await?;

        let mut records: Vec<R> = self.read_file(&path).await?;
        if records.iter().any(|r| r.key() == record.key()) {
            lock.release().await?;
            return Err(StoreError::Duplicate {
                table: R::TABLE.spec().name,
                key: record.key().to_string(),
            });
        }
        records.push(record.clone());
        self.write_file(&path, &records).await?;

        lock.release().await?;
        Ok(record)
    }

    /// Remove every lock marker. Only sound before any writer starts.
    pub async fn recover_locks(&self) -> Result<usize> {
        let removed = lock::clear_locks(&self.inner.root, None).await?;
        if removed > 0 {
            info!("Recovered {} orphaned lock(s) at start-up", removed);
        }
        Ok(removed)
    }

    /// Remove lock markers older than `age`, safe to run alongside writers
    /// as long as `age` exceeds the longest write.
    pub async fn clear_stale_locks(&self, age: Duration) -> Result<usize> {
        lock::clear_locks(&self.inner.root, Some(age)).await
    }

    pub(crate) fn lock_policy(&self) -> &LockPolicy {
        &self.inner.lock_policy
    }

    pub(crate) fn is_partitioned(&self, table: Table) -> bool {
        table.spec().is_indexed()
    }

    pub(crate) fn file_path(&self, table: Table, partition: Option<&str>) -> PathBuf {
        let spec = table.spec();
        match (spec.is_indexed(), partition) {
            (true, Some(p)) => self
                .inner
                .root
                .join(spec.name)
                .join(format!("{}.json", sanitize_partition(p))),
            _ => self.inner.root.join(format!("{}.json", spec.name)),
        }
    }

    /// Every file currently backing `table`.
    pub(crate) async fn collection_files(&self, table: Table) -> Result<Vec<PathBuf>> {
        let spec = table.spec();
        if !spec.is_indexed() {
            return Ok(vec![self.file_path(table, None)]);
        }

        let dir = self.inner.root.join(spec.name);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub(crate) async fn read_file<R: Record>(&self, path: &Path) -> Result<Vec<R>> {
        match fs::read(path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a sibling temp file and rename so readers never observe a
    /// half-written collection.
    pub(crate) async fn write_file<R: Record>(&self, path: &Path, records: &[R]) -> Result<()> {
        let bytes = serde_json::to_vec(records)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub(crate) async fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use huddle_types::models::{Channel, Message, User, Visibility};

    use super::*;

    fn user(email: &str) -> User {
        User {
            email: email.to_string(),
            nickname: "nick".to_string(),
            password_hash: "hash".to_string(),
            channels: Default::default(),
            friends: Default::default(),
            last_seen: Utc::now(),
            self_destruct_at: Utc::now() + ChronoDuration::days(90),
            warned: false,
            public_key: None,
            invites: Vec::new(),
        }
    }

    async fn open() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn users_land_in_first_char_partitions() {
        let (dir, store) = open().await;
        store.insert(user("alice@x.io")).await.unwrap();
        store.insert(user("Adam@x.io")).await.unwrap();
        store.insert(user("bob@x.io")).await.unwrap();

        assert!(dir.path().join("users").join("a.json").exists());
        assert!(dir.path().join("users").join("b.json").exists());

        let all = store.query::<User>().results().await.unwrap();
        assert_eq!(all.len(), 3);

        let found = store.query::<User>().by_key("Adam@x.io").first().await.unwrap();
        assert_eq!(found.unwrap().email, "Adam@x.io");
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let (_dir, store) = open().await;
        store.insert(user("alice@x.io")).await.unwrap();
        let err = store.insert(user("alice@x.io")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { table: "users", .. }));
    }

    #[tokio::test]
    async fn filters_compose_with_and() {
        let (_dir, store) = open().await;
        for name in ["general", "random", "rust"] {
            store
                .insert(Channel::new(name.to_string(), Visibility::Public))
                .await
                .unwrap();
        }
        store
            .insert(Channel::new("secret".to_string(), Visibility::Private))
            .await
            .unwrap();

        let hits = store
            .query::<Channel>()
            .filter(|c| c.is_public())
            .filter(|c| c.name.starts_with('r'))
            .results()
            .await
            .unwrap();
        let mut names: Vec<_> = hits.into_iter().map(|c| c.name).collect();
        names.sort();
        assert_eq!(names, vec!["random", "rust"]);
    }

    #[tokio::test]
    async fn results_are_snapshots() {
        let (_dir, store) = open().await;
        store.insert(user("carol@x.io")).await.unwrap();

        let snapshot = store.query::<User>().by_key("carol@x.io").results().await.unwrap();
        store
            .query::<User>()
            .by_key("carol@x.io")
            .update(|u| u.nickname = "changed".to_string())
            .await
            .unwrap();

        assert_eq!(snapshot[0].nickname, "nick");
        let fresh = store.query::<User>().by_key("carol@x.io").first().await.unwrap().unwrap();
        assert_eq!(fresh.nickname, "changed");
    }

    #[tokio::test]
    async fn update_returns_post_mutation_records() {
        let (_dir, store) = open().await;
        let channel = "c1".to_string();
        for body in ["a", "b", "c"] {
            store
                .insert(Message::new("dave@x.io".into(), channel.clone(), body.into()))
                .await
                .unwrap();
        }
        store
            .insert(Message::new("erin@x.io".into(), channel.clone(), "d".into()))
            .await
            .unwrap();

        let updated = store
            .query::<Message>()
            .within(channel.clone())
            .filter(|m| m.sender == "dave@x.io")
            .update(|m| m.sender = "[deleted]".to_string())
            .await
            .unwrap();
        assert_eq!(updated.len(), 3);
        assert!(updated.iter().all(|m| m.is_tombstoned()));

        let live = store
            .query::<Message>()
            .within(channel)
            .filter(|m| !m.is_tombstoned())
            .results()
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].sender, "erin@x.io");
    }

    #[tokio::test]
    async fn delete_removes_matches_and_empty_partitions() {
        let (dir, store) = open().await;
        store.insert(Message::new("a@x".into(), "c1".into(), "one".into())).await.unwrap();
        store.insert(Message::new("a@x".into(), "c2".into(), "two".into())).await.unwrap();

        let removed = store
            .query::<Message>()
            .within("c1")
            .delete()
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("messages").join("c1.json").exists());

        let rest = store.query::<Message>().results().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].channel, "c2");
    }

    #[tokio::test]
    async fn concurrent_inserts_are_serialized() {
        let (_dir, store) = open().await;
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .insert(Message::new("a@x".into(), "busy".into(), format!("m{i}")))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let all = store.query::<Message>().within("busy").results().await.unwrap();
        assert_eq!(all.len(), 16);
    }

    #[tokio::test]
    async fn start_up_recovery_unblocks_writers() {
        let dir = tempfile::tempdir().unwrap();
        let policy = LockPolicy {
            attempts: 2,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(1),
        };
        let store = Store::open_with(dir.path(), policy).await.unwrap();
        std::fs::write(dir.path().join("channels.json.lock"), "crashed").unwrap();

        let err = store
            .insert(Channel::new("general".into(), Visibility::Public))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));

        assert_eq!(store.recover_locks().await.unwrap(), 1);
        store
            .insert(Channel::new("general".into(), Visibility::Public))
            .await
            .unwrap();
    }
}
