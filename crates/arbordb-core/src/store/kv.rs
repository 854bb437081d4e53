//! Ordered key/value store with write-locking transactions.
//!
//! Tables live in memory as ordered maps and persist as bincode snapshots,
//! one file per database, written on [`Store::sync`]. Duplicate-record
//! databases keep their duplicates sorted, the way the new IDL encoding
//! expects. Lock conflicts between transactions surface immediately as
//! [`StoreError::Deadlock`]; the engine's retry envelope owns recovery.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CursorOp, Db, StoreError, StoreResult};

/// On-disk form of one table.
#[derive(Serialize, Deserialize)]
struct TableSnapshot {
    dup_sort: bool,
    map: BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
}

struct Table {
    dup_sort: bool,
    /// Values per key; a single-element vec unless `dup_sort`.
    map: RwLock<BTreeMap<Vec<u8>, Vec<Vec<u8>>>>,
}

type LockKey = (usize, Vec<u8>);

struct Inner {
    dir: Option<PathBuf>,
    tables: RwLock<Vec<Arc<Table>>>,
    names: RwLock<HashMap<String, usize>>,
    /// Per-key write locks, keyed by (database, key), value = root txn id.
    locks: Mutex<HashMap<LockKey, u64>>,
    next_txn: AtomicU64,
}

/// The store: a set of named ordered databases sharing one lock space.
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Opens (or creates) a store rooted at `dir`, loading any table
    /// snapshots found there.
    ///
    /// # Errors
    ///
    /// Fails on unreadable directories or corrupt snapshots.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(map_io)?;

        let mut tables = Vec::new();
        let mut names = HashMap::new();
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(map_io)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "db"))
            .collect();
        files.sort();

        for path in files {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bytes = std::fs::read(&path).map_err(map_io)?;
            let snapshot: TableSnapshot = bincode::deserialize(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
            names.insert(stem.to_string(), tables.len());
            tables.push(Arc::new(Table {
                dup_sort: snapshot.dup_sort,
                map: RwLock::new(snapshot.map),
            }));
        }
        debug!(dir = %dir.display(), tables = tables.len(), "store opened");

        Ok(Self {
            inner: Arc::new(Inner {
                dir: Some(dir),
                tables: RwLock::new(tables),
                names: RwLock::new(names),
                locks: Mutex::new(HashMap::new()),
                next_txn: AtomicU64::new(1),
            }),
        })
    }

    /// Creates a store with no backing directory; [`Store::sync`] is a no-op.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: None,
                tables: RwLock::new(Vec::new()),
                names: RwLock::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                next_txn: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a named database, creating it on first use.
    ///
    /// `dup_sort` must match the flag the database was created with.
    ///
    /// # Errors
    ///
    /// Fails when the database exists with a different `dup_sort` flag.
    pub fn open_db(&self, name: &str, dup_sort: bool) -> StoreResult<Db> {
        if let Some(&idx) = self.inner.names.read().get(name) {
            let table = self
                .table(Db(idx))
                .map_err(|_| StoreError::Corrupt(format!("table index for {name} is stale")))?;
            if table.dup_sort != dup_sort {
                return Err(StoreError::Corrupt(format!(
                    "database {name} reopened with mismatched duplicate flag"
                )));
            }
            return Ok(Db(idx));
        }

        let mut tables = self.inner.tables.write();
        let mut names = self.inner.names.write();
        // Double-checked: another thread may have created it meanwhile.
        if let Some(&idx) = names.get(name) {
            return Ok(Db(idx));
        }
        let idx = tables.len();
        tables.push(Arc::new(Table {
            dup_sort,
            map: RwLock::new(BTreeMap::new()),
        }));
        names.insert(name.to_string(), idx);
        Ok(Db(idx))
    }

    /// Begins a transaction, optionally as a child of `parent`.
    ///
    /// A child shares the parent's lock ownership; its writes become part of
    /// the parent on commit and only the root commit publishes.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` is part of the store contract.
    pub fn begin(&self, parent: Option<&Txn>) -> StoreResult<Txn> {
        let (root, ancestors, parent_bufs) = match parent {
            Some(p) => {
                let mut chain = p.ancestors.clone();
                chain.push(Arc::clone(&p.writes));
                (
                    p.root,
                    chain,
                    Some((Arc::clone(&p.writes), Arc::clone(&p.acquired))),
                )
            }
            None => (
                self.inner.next_txn.fetch_add(1, Ordering::Relaxed),
                Vec::new(),
                None,
            ),
        };
        Ok(Txn {
            inner: Arc::clone(&self.inner),
            root,
            ancestors,
            writes: Arc::new(Mutex::new(Vec::new())),
            acquired: Arc::new(Mutex::new(Vec::new())),
            parent: parent_bufs,
            done: AtomicBool::new(false),
        })
    }

    /// All database names currently open or loaded.
    #[must_use]
    pub fn db_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.names.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Renames a database (upgrade passes use this); the old name must exist
    /// and the new one must not.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for a missing source, `Corrupt` for a name
    /// collision.
    pub fn rename_db(&self, old: &str, new: &str) -> StoreResult<()> {
        let mut names = self.inner.names.write();
        if names.contains_key(new) {
            return Err(StoreError::Corrupt(format!(
                "cannot rename {old} over existing database {new}"
            )));
        }
        let idx = names.remove(old).ok_or(StoreError::NotFound)?;
        names.insert(new.to_string(), idx);
        drop(names);

        if let Some(dir) = &self.inner.dir {
            let from = dir.join(format!("{old}.db"));
            if from.exists() {
                std::fs::rename(from, dir.join(format!("{new}.db"))).map_err(map_io)?;
            }
        }
        Ok(())
    }

    /// Removes every record from a database. Used by index rebuilds while
    /// the attribute is fenced offline.
    ///
    /// # Errors
    ///
    /// Fails for a stale database handle.
    pub fn truncate_db(&self, db: Db) -> StoreResult<()> {
        self.table(db)?.map.write().clear();
        Ok(())
    }

    /// Writes every table snapshot to the backing directory and prunes
    /// snapshot files whose database no longer exists.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures, mapping out-of-space to
    /// [`StoreError::DiskFull`].
    pub fn sync(&self) -> StoreResult<()> {
        let Some(dir) = &self.inner.dir else {
            return Ok(());
        };
        let names = self.inner.names.read();
        let tables = self.inner.tables.read();
        for (name, &idx) in names.iter() {
            let Some(table) = tables.get(idx) else {
                continue;
            };
            let snapshot = TableSnapshot {
                dup_sort: table.dup_sort,
                map: table.map.read().clone(),
            };
            let bytes = bincode::serialize(&snapshot)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            std::fs::write(dir.join(format!("{name}.db")), bytes).map_err(map_io)?;
        }

        // Prune snapshots for databases that were renamed or dropped.
        for entry in std::fs::read_dir(dir).map_err(map_io)?.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "db") {
                let known = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|stem| names.contains_key(stem));
                if !known {
                    std::fs::remove_file(&path).map_err(map_io)?;
                }
            }
        }
        Ok(())
    }

    /// The backing directory, when the store is persistent.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.inner.dir.as_deref()
    }

    fn table(&self, db: Db) -> StoreResult<Arc<Table>> {
        self.inner
            .tables
            .read()
            .get(db.0)
            .cloned()
            .ok_or_else(|| StoreError::Corrupt("stale database handle".into()))
    }
}

#[derive(Debug, Clone)]
enum WriteOp {
    Put {
        db: usize,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Del {
        db: usize,
        key: Vec<u8>,
    },
    DelValue {
        db: usize,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

type SharedWrites = Arc<Mutex<Vec<WriteOp>>>;
type SharedLocks = Arc<Mutex<Vec<LockKey>>>;

/// A transaction over the store.
///
/// Dropping an unresolved transaction aborts it.
pub struct Txn {
    inner: Arc<Inner>,
    root: u64,
    /// Write buffers of ancestor transactions, root first. Read paths layer
    /// these under this transaction's own buffer.
    ancestors: Vec<SharedWrites>,
    writes: SharedWrites,
    acquired: SharedLocks,
    parent: Option<(SharedWrites, SharedLocks)>,
    done: AtomicBool,
}

impl Txn {
    /// Reads the value under `key` (the first duplicate on `dup_sort`
    /// databases), seeing this transaction's own uncommitted writes.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no record exists.
    pub fn get(&self, db: Db, key: &[u8]) -> StoreResult<Vec<u8>> {
        self.view(db, key)?
            .and_then(|values| values.into_iter().next())
            .ok_or(StoreError::NotFound)
    }

    /// All duplicate values under `key`, in sorted order.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no record exists.
    pub fn get_all(&self, db: Db, key: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        match self.view(db, key)? {
            Some(values) if !values.is_empty() => Ok(values),
            _ => Err(StoreError::NotFound),
        }
    }

    /// Writes `value` under `key`. On a plain database this replaces the
    /// existing value; on a `dup_sort` database it adds one duplicate
    /// (idempotently).
    ///
    /// # Errors
    ///
    /// [`StoreError::Deadlock`] when another transaction holds the key.
    pub fn put(&self, db: Db, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.require_active()?;
        self.lock(db, key)?;
        self.writes.lock().push(WriteOp::Put {
            db: db.0,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Deletes `key` and every duplicate under it.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the key does not exist,
    /// [`StoreError::Deadlock`] on lock conflict.
    pub fn del(&self, db: Db, key: &[u8]) -> StoreResult<()> {
        self.require_active()?;
        self.lock(db, key)?;
        match self.view(db, key)? {
            Some(values) if !values.is_empty() => {
                self.writes.lock().push(WriteOp::Del {
                    db: db.0,
                    key: key.to_vec(),
                });
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }

    /// Deletes one duplicate record under `key`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when that duplicate does not exist,
    /// [`StoreError::Deadlock`] on lock conflict.
    pub fn del_value(&self, db: Db, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.require_active()?;
        self.lock(db, key)?;
        let present = self
            .view(db, key)?
            .is_some_and(|values| values.iter().any(|v| v == value));
        if !present {
            return Err(StoreError::NotFound);
        }
        self.writes.lock().push(WriteOp::DelValue {
            db: db.0,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Opens a cursor over the database as this transaction sees it.
    ///
    /// The cursor is a consistent snapshot; later writes through this
    /// transaction are not reflected in an already-open cursor.
    ///
    /// # Errors
    ///
    /// Fails for a stale database handle.
    pub fn cursor(&self, db: Db) -> StoreResult<Cursor> {
        let table = self.table(db)?;
        let mut map = table.map.read().clone();
        for buf in self.ancestors.iter().chain(std::iter::once(&self.writes)) {
            for op in buf.lock().iter() {
                apply_op(&mut map, table.dup_sort, db.0, op);
            }
        }
        let mut pairs = Vec::new();
        for (key, values) in &map {
            for value in values {
                pairs.push((key.clone(), value.clone()));
            }
        }
        Ok(Cursor { pairs, pos: None })
    }

    /// Commits this transaction: a child merges into its parent, the root
    /// publishes every buffered write and releases its locks.
    ///
    /// # Errors
    ///
    /// Fails for stale database handles captured in buffered writes.
    pub fn commit(self) -> StoreResult<()> {
        self.done.store(true, Ordering::Relaxed);
        if let Some((parent_writes, parent_locks)) = &self.parent {
            parent_writes.lock().append(&mut self.writes.lock());
            parent_locks.lock().append(&mut self.acquired.lock());
            return Ok(());
        }

        let tables = self.inner.tables.read();
        for op in self.writes.lock().drain(..) {
            let idx = match &op {
                WriteOp::Put { db, .. } | WriteOp::Del { db, .. } | WriteOp::DelValue { db, .. } => {
                    *db
                }
            };
            let table = tables
                .get(idx)
                .ok_or_else(|| StoreError::Corrupt("stale database handle".into()))?;
            let mut map = table.map.write();
            apply_op(&mut map, table.dup_sort, idx, &op);
        }
        drop(tables);
        self.release_locks();
        Ok(())
    }

    /// Abandons this transaction, discarding its writes and releasing the
    /// locks it acquired.
    pub fn abort(self) {
        self.done.store(true, Ordering::Relaxed);
        self.writes.lock().clear();
        self.release_locks();
    }

    fn require_active(&self) -> StoreResult<()> {
        if self.done.load(Ordering::Relaxed) {
            return Err(StoreError::Corrupt("transaction already resolved".into()));
        }
        Ok(())
    }

    fn lock(&self, db: Db, key: &[u8]) -> StoreResult<()> {
        let mut locks = self.inner.locks.lock();
        let lock_key = (db.0, key.to_vec());
        match locks.get(&lock_key) {
            Some(&owner) if owner != self.root => Err(StoreError::Deadlock),
            Some(_) => Ok(()),
            None => {
                locks.insert(lock_key.clone(), self.root);
                self.acquired.lock().push(lock_key);
                Ok(())
            }
        }
    }

    fn release_locks(&self) {
        let mut locks = self.inner.locks.lock();
        for lock_key in self.acquired.lock().drain(..) {
            locks.remove(&lock_key);
        }
    }

    fn table(&self, db: Db) -> StoreResult<Arc<Table>> {
        self.inner
            .tables
            .read()
            .get(db.0)
            .cloned()
            .ok_or_else(|| StoreError::Corrupt("stale database handle".into()))
    }

    /// Committed values overlaid with the write chain, for one key.
    fn view(&self, db: Db, key: &[u8]) -> StoreResult<Option<Vec<Vec<u8>>>> {
        let table = self.table(db)?;
        let mut values: Option<Vec<Vec<u8>>> = table.map.read().get(key).cloned();
        for buf in self.ancestors.iter().chain(std::iter::once(&self.writes)) {
            for op in buf.lock().iter() {
                match op {
                    WriteOp::Put {
                        db: d,
                        key: k,
                        value,
                    } if *d == db.0 && k == key => {
                        if table.dup_sort {
                            let dups = values.get_or_insert_with(Vec::new);
                            if let Err(at) = dups.binary_search(value) {
                                dups.insert(at, value.clone());
                            }
                        } else {
                            values = Some(vec![value.clone()]);
                        }
                    }
                    WriteOp::Del { db: d, key: k } if *d == db.0 && k == key => {
                        values = None;
                    }
                    WriteOp::DelValue {
                        db: d,
                        key: k,
                        value,
                    } if *d == db.0 && k == key => {
                        if let Some(dups) = &mut values {
                            dups.retain(|v| v != value);
                            if dups.is_empty() {
                                values = None;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(values)
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.done.load(Ordering::Relaxed) {
            self.writes.lock().clear();
            self.release_locks();
        }
    }
}

fn apply_op(map: &mut BTreeMap<Vec<u8>, Vec<Vec<u8>>>, dup_sort: bool, db: usize, op: &WriteOp) {
    match op {
        WriteOp::Put { db: d, key, value } if *d == db => {
            if dup_sort {
                let dups = map.entry(key.clone()).or_default();
                if let Err(at) = dups.binary_search(value) {
                    dups.insert(at, value.clone());
                }
            } else {
                map.insert(key.clone(), vec![value.clone()]);
            }
        }
        WriteOp::Del { db: d, key } if *d == db => {
            map.remove(key);
        }
        WriteOp::DelValue { db: d, key, value } if *d == db => {
            if let Some(dups) = map.get_mut(key) {
                dups.retain(|v| v != value);
                if dups.is_empty() {
                    map.remove(key);
                }
            }
        }
        _ => {}
    }
}

/// Snapshot cursor over one database.
pub struct Cursor {
    /// Flattened (key, value) records, duplicates expanded in order.
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
}

impl Cursor {
    /// Positions the cursor per `op` and returns the record there.
    ///
    /// `key` is consulted by [`CursorOp::Set`] and [`CursorOp::SetRange`]
    /// and ignored otherwise. A fresh cursor treats `Next` as `First` and
    /// `Prev` as `Last`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no record satisfies the operation.
    pub fn seek(&mut self, op: CursorOp, key: Option<&[u8]>) -> StoreResult<(Vec<u8>, Vec<u8>)> {
        let pos = match op {
            CursorOp::Set => {
                let wanted = key.ok_or(StoreError::NotFound)?;
                let at = self.pairs.partition_point(|(k, _)| k.as_slice() < wanted);
                if self.pairs.get(at).is_some_and(|(k, _)| k == wanted) {
                    Some(at)
                } else {
                    None
                }
            }
            CursorOp::SetRange => {
                let wanted = key.ok_or(StoreError::NotFound)?;
                let at = self.pairs.partition_point(|(k, _)| k.as_slice() < wanted);
                (at < self.pairs.len()).then_some(at)
            }
            CursorOp::First => (!self.pairs.is_empty()).then_some(0),
            CursorOp::Last => self.pairs.len().checked_sub(1),
            CursorOp::Next => match self.pos {
                None => (!self.pairs.is_empty()).then_some(0),
                Some(p) => (p + 1 < self.pairs.len()).then_some(p + 1),
            },
            CursorOp::NextNoDup => match self.pos {
                None => (!self.pairs.is_empty()).then_some(0),
                Some(p) => {
                    let current = &self.pairs[p].0;
                    let at = self.pairs.partition_point(|(k, _)| k <= current);
                    (at < self.pairs.len()).then_some(at)
                }
            },
            CursorOp::Prev => match self.pos {
                None => self.pairs.len().checked_sub(1),
                Some(p) => p.checked_sub(1),
            },
        };
        match pos {
            Some(p) => {
                self.pos = Some(p);
                Ok(self.pairs[p].clone())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

fn map_io(err: std::io::Error) -> StoreError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => StoreError::Permission(err.to_string()),
        std::io::ErrorKind::StorageFull => StoreError::DiskFull,
        _ => StoreError::Io(err),
    }
}
