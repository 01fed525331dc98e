use std::marker::PhantomData;
use std::path::PathBuf;

use tracing::debug;

use crate::Store;
use crate::error::Result;
use crate::lock::TableLock;
use crate::table::{Record, partition_for_key};

type Predicate<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

/// Read cursor over one collection, optionally narrowed to a single
/// partition. Filters compose by AND and never touch storage; the terminal
/// operations (`results`, `update`, `delete`) do.
pub struct Query<R: Record> {
    store: Store,
    partition: Option<String>,
    filters: Vec<Predicate<R>>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Query<R> {
    pub(crate) fn new(store: Store) -> Self {
        Self {
            store,
            partition: None,
            filters: Vec::new(),
            _record: PhantomData,
        }
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Box::new(predicate));
        self
    }

    /// Restrict the cursor to one index partition. Ignored for unindexed
    /// tables.
    pub fn within(mut self, partition: impl Into<String>) -> Self {
        if R::TABLE.spec().is_indexed() {
            self.partition = Some(partition.into());
        }
        self
    }

    /// Match a single primary key, narrowing to its partition when the
    /// table is indexed by key.
    pub fn by_key(mut self, key: &str) -> Self {
        if let Some(partition) = partition_for_key(R::TABLE, key) {
            self.partition = Some(partition);
        }
        let key = key.to_string();
        self.filter(move |r: &R| r.key() == key)
    }

    fn matches(&self, record: &R) -> bool {
        self.filters.iter().all(|f| f(record))
    }

    async fn files(&self) -> Result<Vec<PathBuf>> {
        match &self.partition {
            Some(p) => Ok(vec![self.store.file_path(R::TABLE, Some(p))]),
            None => self.store.collection_files(R::TABLE).await,
        }
    }

    /// Snapshot of every matching record.
    pub async fn results(&self) -> Result<Vec<R>> {
        let mut out = Vec::new();
        for path in self.files().await? {
            let records: Vec<R> = self.store.read_file(&path).await?;
            out.extend(records.into_iter().filter(|r| self.matches(r)));
        }
        Ok(out)
    }

    pub async fn first(&self) -> Result<Option<R>> {
        Ok(self.results().await?.into_iter().next())
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.first().await?.is_some())
    }

    /// Apply `mutator` to every match and persist each touched file under
    /// its write lock. Returns the matches after mutation.
    ///
    /// The mutator must not change a record's key or partition value.
    pub async fn update<M>(&self, mut mutator: M) -> Result<Vec<R>>
    where
        M: FnMut(&mut R) + Send,
    {
        let mut updated = Vec::new();
        for path in self.files().await? {
            let lock = TableLock::acquire(&path, self.store.lock_policy()).await?;
            let mut records: Vec<R> = self.store.read_file(&path).await?;

            let before = updated.len();
            for record in records.iter_mut().filter(|r| self.matches(r)) {
                mutator(record);
                updated.push(record.clone());
            }
            if updated.len() > before {
                self.store.write_file(&path, &records).await?;
                debug!(
                    "Updated {} record(s) in {}",
                    updated.len() - before,
                    path.display()
                );
            }
            lock.release().await?;
        }
        Ok(updated)
    }

    /// Remove every match. Returns how many records were deleted.
    pub async fn delete(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.files().await? {
            let lock = TableLock::acquire(&path, self.store.lock_policy()).await?;
            let mut records: Vec<R> = self.store.read_file(&path).await?;

            let before = records.len();
            records.retain(|r| !self.matches(r));
            let gone = before - records.len();
            if gone > 0 {
                if records.is_empty() && self.store.is_partitioned(R::TABLE) {
                    self.store.remove_file(&path).await?;
                } else {
                    self.store.write_file(&path, &records).await?;
                }
                debug!("Deleted {} record(s) from {}", gone, path.display());
                removed += gone;
            }
            lock.release().await?;
        }
        Ok(removed)
    }
}
