//! One backend instance: the wiring between configuration, store, cache,
//! and the per-attribute registries.
//!
//! The operation API (`add`, `modify`, `delete`, `modrdn`,
//! `search_candidates`, `seq`, and the administrative operations) hangs off
//! [`Instance`] in the `ops`, `index`, `ancestor` and `filter` modules;
//! this module owns the struct itself, database handle management, the
//! `id2entry` read/write path (with attribute encryption), and the
//! busy/read-only/fatal state word.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::cache::EntryCache;
use crate::config::InstanceConfig;
use crate::crypt::AttrCrypt;
use crate::dbversion::DbVersion;
use crate::entry::{Attribute, Entry};
use crate::error::{Error, Result};
use crate::id::{EntryId, NextId, NOID};
use crate::index::attrinfo::AttrInfoRegistry;
use crate::plugin::PluginRegistry;
use crate::store::{CursorOp, Db, Store, StoreError, Txn};

/// Database name of the id→entry store.
pub const ID2ENTRY: &str = "id2entry";

/// Database name of the DN tree table (subtree-rename mode).
pub const ENTRYRDN: &str = "entryrdn";

/// Unique ID of the replication update vector entry.
pub const RUV_UNIQUEID: &str = "ffffffff-ffffffff-ffffffff-ffffffff";

/// A directory backend instance.
pub struct Instance {
    config: InstanceConfig,
    dir: Option<PathBuf>,
    store: Store,
    id2entry: Db,
    index_dbs: DashMap<String, Db>,
    next_id: NextId,
    cache: EntryCache,
    attrinfo: AttrInfoRegistry,
    plugins: PluginRegistry,
    /// Serializes all writers when `serial_lock` is configured.
    serial_lock: Option<Mutex<()>>,
    busy: AtomicBool,
    read_only: AtomicBool,
    fatal: AtomicBool,
}

impl Instance {
    /// Opens (or creates) an instance rooted at `dir`.
    ///
    /// Checks the `DBVERSION` file (running the rename-pass upgrade when
    /// the on-disk layout is one axis behind), recovers the next-ID state
    /// from the last `id2entry` key, and opens the system databases.
    ///
    /// # Errors
    ///
    /// Configuration, version and store failures propagate.
    pub fn open(dir: impl AsRef<Path>, config: InstanceConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let config = config.validated()?;
        DbVersion::check_or_init(&dir, config.idl_switch)?;
        let store = Store::open(&dir).map_err(Error::from)?;
        let instance = Self::wire(store, Some(dir), config)?;
        info!(
            suffix = %instance.config.suffix,
            idl = %instance.config.idl_switch,
            "instance opened"
        );
        Ok(instance)
    }

    /// An instance with no backing directory, for tests and tooling.
    ///
    /// # Errors
    ///
    /// Configuration failures propagate.
    pub fn in_memory(config: InstanceConfig) -> Result<Self> {
        let config = config.validated()?;
        Self::wire(Store::in_memory(), None, config)
    }

    fn wire(store: Store, dir: Option<PathBuf>, config: InstanceConfig) -> Result<Self> {
        let id2entry = store.open_db(ID2ENTRY, false).map_err(Error::from)?;
        let next = {
            let txn = store.begin(None).map_err(Error::from)?;
            let mut cursor = txn.cursor(id2entry).map_err(Error::from)?;
            let last = match cursor.seek(CursorOp::Last, None) {
                Ok((key, _)) => {
                    let buf: [u8; 4] = key.as_slice().try_into().map_err(|_| {
                        Error::Serialization("id2entry key is not a 32-bit ID".into())
                    })?;
                    EntryId::from_be_bytes(buf).0 + 1
                }
                Err(StoreError::NotFound) => 1,
                Err(err) => return Err(err.into()),
            };
            txn.abort();
            last
        };
        let serial_lock = config.serial_lock.then(|| Mutex::new(()));
        Ok(Self {
            cache: EntryCache::new(config.cachesize, config.cachememsize),
            attrinfo: AttrInfoRegistry::from_config(&config),
            plugins: PluginRegistry::new(),
            next_id: NextId::new(next),
            serial_lock,
            config,
            dir,
            store,
            id2entry,
            index_dbs: DashMap::new(),
            busy: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        })
    }

    /// The instance configuration.
    #[must_use]
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// The backing directory, when persistent.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The `id2entry` database handle.
    #[must_use]
    pub fn id2entry_db(&self) -> Db {
        self.id2entry
    }

    /// The entry cache.
    #[must_use]
    pub fn cache(&self) -> &EntryCache {
        &self.cache
    }

    /// The attribute-info table.
    #[must_use]
    pub fn attrinfo(&self) -> &AttrInfoRegistry {
        &self.attrinfo
    }

    /// The plugin table.
    #[must_use]
    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// The ID allocator.
    #[must_use]
    pub fn next_id(&self) -> &NextId {
        &self.next_id
    }

    /// Current next-ID value, which sizes AllIds sentinels.
    #[must_use]
    pub fn next_id_value(&self) -> u32 {
        self.next_id.peek().0
    }

    /// Installs the encryption provider for a configured attribute.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the attribute is unknown or not flagged for
    /// encryption.
    pub fn install_attrcrypt(&self, attr: &str, provider: Arc<dyn AttrCrypt>) -> Result<()> {
        let ai = self
            .attrinfo
            .get(attr)
            .ok_or_else(|| Error::Config(format!("unknown attribute {attr}")))?;
        if !ai.wants_crypt() {
            return Err(Error::Config(format!(
                "attribute {attr} is not configured for encryption"
            )));
        }
        ai.install_crypt(provider);
        Ok(())
    }

    /// The index database for one attribute, opened on first use.
    ///
    /// # Errors
    ///
    /// Store failures propagate.
    pub fn index_db(&self, attr: &str) -> Result<Db> {
        let attr = attr.to_ascii_lowercase();
        if let Some(db) = self.index_dbs.get(&attr) {
            return Ok(*db);
        }
        let dup = self.config.idl_switch.dup_sort();
        let db = self.store.open_db(&attr, dup).map_err(Error::from)?;
        self.index_dbs.insert(attr, db);
        Ok(db)
    }

    /// The DN tree database (subtree-rename mode).
    ///
    /// # Errors
    ///
    /// Store failures propagate.
    pub fn entryrdn_db(&self) -> Result<Db> {
        if let Some(db) = self.index_dbs.get(ENTRYRDN) {
            return Ok(*db);
        }
        let db = self.store.open_db(ENTRYRDN, false).map_err(Error::from)?;
        self.index_dbs.insert(ENTRYRDN.to_string(), db);
        Ok(db)
    }

    // ---- state word ----

    /// Refuses work once a fatal store condition latched, and while the
    /// instance is fenced busy or read-only (for writes).
    ///
    /// # Errors
    ///
    /// [`Error::UnwillingToPerform`] with the blocking state.
    pub fn check_writable(&self) -> Result<()> {
        if self.fatal.load(Ordering::Acquire) {
            return Err(Error::UnwillingToPerform(
                "instance stopped after fatal store error".into(),
            ));
        }
        if self.busy.load(Ordering::Acquire) {
            return Err(Error::UnwillingToPerform("instance is busy".into()));
        }
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::UnwillingToPerform("instance is read-only".into()));
        }
        Ok(())
    }

    /// Latches the fatal flag when `err` demands it, so later operations
    /// refuse promptly.
    pub fn note_fatal(&self, err: &Error) {
        if err.is_fatal() {
            error!(code = err.code(), "fatal store condition, refusing further writes");
            self.fatal.store(true, Ordering::Release);
        }
    }

    /// Fences the instance busy (bulk jobs). Returns false when already
    /// busy.
    pub fn set_busy(&self) -> bool {
        !self.busy.swap(true, Ordering::AcqRel)
    }

    /// Clears the busy fence.
    pub fn clear_busy(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Sets or clears read-only mode.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Takes the serializing writer lock when `serial_lock` is configured.
    #[must_use]
    pub fn serial_guard(&self) -> Option<parking_lot::MutexGuard<'_, ()>> {
        self.serial_lock.as_ref().map(Mutex::lock)
    }

    // ---- id2entry ----

    /// Serializes and writes `entry` under its ID, encrypting configured
    /// attributes on the way out.
    ///
    /// # Errors
    ///
    /// Store, serialization and cipher failures propagate.
    pub fn entry_store(&self, txn: &Txn, entry: &Entry) -> Result<()> {
        debug_assert!(entry.id() != NOID);
        let sealed = self.encrypt_entry(entry)?;
        let bytes = sealed.to_stored()?;
        txn.put(self.id2entry, &entry.id().to_be_bytes(), &bytes)?;
        Ok(())
    }

    /// Removes the stored row of `id`.
    ///
    /// # Errors
    ///
    /// Store failures propagate; a missing row is fine (idempotent).
    pub fn entry_erase(&self, txn: &Txn, id: EntryId) -> Result<()> {
        match txn.del(self.id2entry, &id.to_be_bytes()) {
            Ok(()) | Err(StoreError::NotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads and decodes the entry stored under `id`, decrypting
    /// configured attributes.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchObject`] when the row does not exist.
    pub fn entry_fetch(&self, txn: &Txn, id: EntryId) -> Result<Entry> {
        let bytes = match txn.get(self.id2entry, &id.to_be_bytes()) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound) => {
                return Err(Error::NoSuchObject(format!("id {id}")));
            }
            Err(err) => return Err(err.into()),
        };
        let entry = Entry::from_stored(&bytes)?;
        self.decrypt_entry(entry)
    }

    fn encrypt_entry(&self, entry: &Entry) -> Result<Entry> {
        let mut sealed = entry.clone();
        for attr in entry.attributes() {
            let Some(ai) = self.attrinfo.get(attr.base_type()) else {
                continue;
            };
            let Some(provider) = ai.crypt() else {
                if ai.wants_crypt() {
                    return Err(Error::Crypt(format!(
                        "no encryption provider installed for {}",
                        attr.base_type()
                    )));
                }
                continue;
            };
            let mut values = Vec::with_capacity(attr.values.len());
            for value in &attr.values {
                values.push(provider.encrypt_value(value)?);
            }
            sealed.replace_values(&attr.name, &values);
        }
        Ok(sealed)
    }

    fn decrypt_entry(&self, mut entry: Entry) -> Result<Entry> {
        let attrs: Vec<Attribute> = entry.attributes().to_vec();
        for attr in attrs {
            let Some(ai) = self.attrinfo.get(attr.base_type()) else {
                continue;
            };
            let Some(provider) = ai.crypt() else {
                continue;
            };
            let mut values = Vec::with_capacity(attr.values.len());
            for value in &attr.values {
                values.push(provider.decrypt_value(value)?);
            }
            entry.replace_values(&attr.name, &values);
        }
        Ok(entry)
    }

    /// Flushes the store to its backing directory.
    ///
    /// # Errors
    ///
    /// Store failures propagate; disk-full latches the fatal flag.
    pub fn sync(&self) -> Result<()> {
        let out = self.store.sync().map_err(Error::from);
        if let Err(err) = &out {
            self.note_fatal(err);
        }
        debug!("instance synced");
        out
    }
}
