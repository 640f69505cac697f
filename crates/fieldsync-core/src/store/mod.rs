//! Local transactional storage.
//!
//! The store keeps a fixed set of named collections (see [`schema`]), each an
//! ordered map from an encoded key to a JSON record. Every collection is
//! guarded by its own read/write lock: read transactions share it, read-write
//! transactions hold it exclusively until their changes are persisted, so no
//! partial write is ever visible to another transaction on that collection.
//!
//! Several processes may use the same storage (a long-running `watch` next
//! to one-shot commands). Each transaction starts from the persisted table,
//! and read-write transactions also hold the backend's [`StorageLock`], so a
//! commit never overwrites records another process added.
//!
//! ```rust,ignore
//! let store = Store::new(FileBackend::new(dir));
//! let handle = store.open().await?;
//! let id = handle
//!     .transaction::<OutboxCollection, _, _>(Mode::ReadWrite, |tx| {
//!         let id = tx.allocate_id()?;
//!         tx.put(&id, &record)?;
//!         Ok(id)
//!     })
//!     .await?;
//! ```

pub mod backend;
pub mod error;
pub mod schema;

use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

pub use backend::{
    FileBackend, MemoryBackend, RawTable, SchemaManifest, StorageBackend, StorageLock,
};
pub use error::StoreError;
pub use schema::SCHEMA_VERSION;

use schema::Tables;

/// A key that can be encoded into an order-preserving string.
pub trait RecordKey {
    fn encode(&self) -> String;
}

impl RecordKey for u64 {
    fn encode(&self) -> String {
        // Zero padding keeps lexical order equal to numeric order
        format!("{:020}", self)
    }
}

impl RecordKey for str {
    fn encode(&self) -> String {
        self.to_string()
    }
}

/// A typed view of one named collection.
pub trait Collection: Send + Sync + 'static {
    const NAME: &'static str;
    type Key: RecordKey + ?Sized;
    type Record: Serialize + DeserializeOwned;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    ReadWrite,
}

struct Inner {
    backend: Box<dyn StorageBackend>,
    target_version: u32,
    tables: OnceCell<Tables>,
}

/// Unopened store. Cheap to clone; clones share one set of collections.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    pub fn new(backend: impl StorageBackend + 'static) -> Self {
        Self::with_schema_version(backend, SCHEMA_VERSION)
    }

    /// Open at an explicit schema version instead of the current one.
    pub fn with_schema_version(backend: impl StorageBackend + 'static, version: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: Box::new(backend),
                target_version: version,
                tables: OnceCell::new(),
            }),
        }
    }

    /// Run schema migration (first call only) and return a handle.
    ///
    /// Safe to call repeatedly and concurrently: concurrent callers wait for
    /// the single migration, later callers get the already-open collections.
    /// A failure is returned as-is; the store does not retry on its own.
    pub async fn open(&self) -> Result<StoreHandle, StoreError> {
        let inner = &self.inner;
        inner
            .tables
            .get_or_try_init(|| schema::migrate(inner.backend.as_ref(), inner.target_version))
            .await?;
        Ok(StoreHandle {
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Handle to an open store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Inner>,
}

impl StoreHandle {
    fn tables(&self) -> Result<&Tables, StoreError> {
        // A handle only exists after a successful open
        self.inner
            .tables
            .get()
            .ok_or_else(|| StoreError::Unavailable("store not open".to_string()))
    }

    pub fn schema_version(&self) -> u32 {
        self.tables().map(|t| t.version).unwrap_or_default()
    }

    /// Run `f` against collection `C`.
    ///
    /// In `ReadWrite` mode `f` works on a private copy; the copy is persisted
    /// and published only if `f` succeeds and the backend write succeeds.
    pub async fn transaction<C, R, F>(&self, mode: Mode, f: F) -> Result<R, StoreError>
    where
        C: Collection,
        F: FnOnce(&mut Transaction<'_, C>) -> Result<R, StoreError>,
    {
        let lock: &RwLock<RawTable> = self
            .tables()?
            .collections
            .get(C::NAME)
            .ok_or_else(|| StoreError::UnknownCollection(C::NAME.to_string()))?;

        match mode {
            Mode::Read => {
                let mut guard = lock.write().await;
                self.refresh(C::NAME, &mut guard).await?;
                let guard = guard.downgrade();
                let mut tx = Transaction::new(TxTable::Read(&*guard));
                f(&mut tx)
            }
            Mode::ReadWrite => {
                let mut guard = lock.write().await;
                let _storage = self.inner.backend.lock().await?;
                self.refresh(C::NAME, &mut guard).await?;
                let mut tx = Transaction::new(TxTable::Write(guard.clone()));
                let result = f(&mut tx)?;
                if let (true, TxTable::Write(table)) = (tx.dirty, tx.table) {
                    self.inner.backend.save_table(C::NAME, &table).await?;
                    *guard = table;
                    debug!(collection = C::NAME, "Transaction committed");
                }
                Ok(result)
            }
        }
    }

    /// Replace the cached table with the persisted one, if there is one.
    async fn refresh(&self, name: &str, cached: &mut RawTable) -> Result<(), StoreError> {
        if let Some(table) = self.inner.backend.load_table(name).await? {
            *cached = table;
        }
        Ok(())
    }

    pub async fn read<C, R, F>(&self, f: F) -> Result<R, StoreError>
    where
        C: Collection,
        F: FnOnce(&mut Transaction<'_, C>) -> Result<R, StoreError>,
    {
        self.transaction(Mode::Read, f).await
    }

    pub async fn write<C, R, F>(&self, f: F) -> Result<R, StoreError>
    where
        C: Collection,
        F: FnOnce(&mut Transaction<'_, C>) -> Result<R, StoreError>,
    {
        self.transaction(Mode::ReadWrite, f).await
    }
}

enum TxTable<'a> {
    Read(&'a RawTable),
    Write(RawTable),
}

/// Typed access to one collection inside a transaction.
pub struct Transaction<'a, C: Collection> {
    table: TxTable<'a>,
    dirty: bool,
    _collection: PhantomData<fn() -> C>,
}

impl<'a, C: Collection> Transaction<'a, C> {
    fn new(table: TxTable<'a>) -> Self {
        Self {
            table,
            dirty: false,
            _collection: PhantomData,
        }
    }

    fn raw(&self) -> &RawTable {
        match &self.table {
            TxTable::Read(table) => *table,
            TxTable::Write(table) => table,
        }
    }

    fn raw_mut(&mut self) -> Result<&mut RawTable, StoreError> {
        match &mut self.table {
            TxTable::Read(_) => Err(StoreError::ReadOnly(C::NAME)),
            TxTable::Write(table) => {
                self.dirty = true;
                Ok(table)
            }
        }
    }

    pub fn get(&self, key: &C::Key) -> Result<Option<C::Record>, StoreError> {
        self.raw()
            .entries
            .get(&key.encode())
            .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .transpose()
    }

    pub fn contains(&self, key: &C::Key) -> bool {
        self.raw().entries.contains_key(&key.encode())
    }

    /// All records in key order.
    pub fn get_all(&self) -> Result<Vec<C::Record>, StoreError> {
        self.raw()
            .entries
            .values()
            .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .collect()
    }

    /// Encoded keys in key order, without decoding records.
    pub fn keys(&self) -> Vec<String> {
        self.raw().entries.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.raw().entries.len()
    }

    /// Reserve the next auto-increment id. Ids start at 1 and are never
    /// handed out twice, even after the record is deleted.
    pub fn allocate_id(&mut self) -> Result<u64, StoreError> {
        let table = self.raw_mut()?;
        table.next_id += 1;
        Ok(table.next_id)
    }

    /// Insert or overwrite the record stored under `key`.
    pub fn put(&mut self, key: &C::Key, record: &C::Record) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)?;
        self.raw_mut()?.entries.insert(key.encode(), value);
        Ok(())
    }

    /// Returns whether a record was removed.
    pub fn delete(&mut self, key: &C::Key) -> Result<bool, StoreError> {
        Ok(self.raw_mut()?.entries.remove(&key.encode()).is_some())
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.raw_mut()?.entries.clear();
        Ok(())
    }
}
