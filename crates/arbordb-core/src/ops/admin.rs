//! Administrative operations: bind/compare/abandon/unbind glue and the
//! bulk jobs (import, export, backup, restore, rebuild-index, upgrade).
//!
//! Bulk jobs fence the instance busy and use the attribute OFFLINE bit so
//! concurrent writers treat affected attributes as unindexed; they bypass
//! the per-operation envelope and batch their index writes through
//! [`IndexBuffer`].

use std::io::Write as _;
use std::path::Path;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::config::InstanceConfig;
use crate::dbversion::DbVersion;
use crate::entry::{opattr, Dn, Entry};
use crate::error::{Error, Result};
use crate::id::EntryId;
use crate::index::buffer::IndexBuffer;
use crate::index::keys;
use crate::instance::Instance;
use crate::store::{CursorOp, StoreError};
use crate::txn::OpContext;

/// Releases the busy fence and the OFFLINE bits on drop, so bulk jobs
/// cannot leave the instance fenced on an error path.
struct BulkFence<'a> {
    instance: &'a Instance,
    offlined: Vec<String>,
}

impl<'a> BulkFence<'a> {
    fn acquire(instance: &'a Instance, attrs: &[String]) -> Result<Self> {
        if !instance.set_busy() {
            return Err(Error::UnwillingToPerform("instance is busy".into()));
        }
        let mut offlined = Vec::new();
        for attr in attrs {
            if let Some(ai) = instance.attrinfo().get(attr) {
                ai.set_offline(true);
                offlined.push(attr.clone());
            }
        }
        Ok(Self { instance, offlined })
    }
}

impl Drop for BulkFence<'_> {
    fn drop(&mut self) {
        for attr in &self.offlined {
            if let Some(ai) = self.instance.attrinfo().get(attr) {
                ai.set_offline(false);
            }
        }
        self.instance.clear_busy();
    }
}

impl Instance {
    /// Resolves a bind DN and returns the stored credential values for
    /// the front-end to verify.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchObject`] for an unknown DN.
    pub fn bind(&self, _ctx: &OpContext, dn: &Dn) -> Result<Vec<Vec<u8>>> {
        let txn = self.store().begin(None).map_err(Error::from)?;
        let entry = self.dn2entry(&txn, dn)?;
        txn.abort();
        let entry = entry.ok_or_else(|| Error::NoSuchObject(dn.to_string()))?;
        Ok(entry
            .attr("userpassword")
            .map(|a| a.values.clone())
            .unwrap_or_default())
    }

    /// Acknowledges the end of a client session. The engine keeps no
    /// per-connection state.
    pub fn unbind(&self) {}

    /// Compares one asserted value against the entry at `dn`.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchObject`] for an unknown DN.
    pub fn compare(&self, _ctx: &OpContext, dn: &Dn, attr: &str, value: &[u8]) -> Result<bool> {
        let txn = self.store().begin(None).map_err(Error::from)?;
        let entry = self.dn2entry(&txn, dn)?;
        txn.abort();
        let entry = entry.ok_or_else(|| Error::NoSuchObject(dn.to_string()))?;
        Ok(entry.has_value(attr, value))
    }

    /// Marks the operation abandoned; in-flight scans notice on their
    /// next sampling interval.
    pub fn abandon(&self, ctx: &OpContext) {
        ctx.abandon();
    }

    /// Bulk-loads entries, bypassing the per-operation envelope.
    ///
    /// Entries must arrive parent before child. IDs are assigned
    /// sequentially, index writes are batched through per-attribute
    /// buffers, `ancestorid` is rebuilt from scratch afterwards, and
    /// parent subordinate counts are recomputed.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchObject`] when a child arrives before its parent;
    /// store failures propagate. The busy fence always lifts.
    pub fn import(&self, entries: Vec<Entry>) -> Result<usize> {
        let attrs = self.attrinfo().attrs();
        let fence = BulkFence::acquire(self, &attrs)?;

        let mut buffers: FxHashMap<String, IndexBuffer> = attrs
            .iter()
            .map(|attr| (attr.clone(), IndexBuffer::new(attr, 0)))
            .collect();
        let mut dn_to_id: FxHashMap<String, EntryId> = FxHashMap::default();
        let mut child_counts: FxHashMap<EntryId, usize> = FxHashMap::default();

        let txn = self.store().begin(None).map_err(Error::from)?;
        let mut imported = 0usize;
        for mut entry in entries {
            let parent_id = match entry.dn().parent() {
                Some(parent_dn) => Some(
                    dn_to_id
                        .get(parent_dn.as_str())
                        .copied()
                        .ok_or_else(|| Error::NoSuchObject(parent_dn.to_string()))?,
                ),
                None => None,
            };
            let id = self.next_id().next()?;
            entry.set_bookkeeping(id, parent_id);

            self.entry_store(&txn, &entry)?;
            self.dn_link_add(&txn, &entry, parent_id)?;
            dn_to_id.insert(entry.dn().as_str().to_string(), id);
            if let Some(pid) = parent_id {
                *child_counts.entry(pid).or_insert(0) += 1;
            }
            for buffer in buffers.values_mut() {
                buffer.collect_entry(self, &entry)?;
            }
            imported += 1;
        }
        for buffer in buffers.values_mut() {
            buffer.flush(self, &txn)?;
        }

        // Parent bookkeeping in one pass.
        for (&pid, &count) in &child_counts {
            let mut parent = self.entry_fetch(&txn, pid)?;
            parent.set_single_str(opattr::NUMSUBORDINATES, &count.to_string());
            parent.set_single_str(opattr::HASSUBORDINATES, "TRUE");
            self.entry_store(&txn, &parent)?;
        }
        txn.commit().map_err(Error::from)?;

        // The hierarchy closure is rebuilt, not maintained, on import.
        self.ancestorid_create_index()?;

        drop(fence);
        info!(imported, "bulk import finished");
        Ok(imported)
    }

    /// Streams every live entry (ID order, decrypted) as one JSON object
    /// per line.
    ///
    /// # Errors
    ///
    /// Store and I/O failures propagate.
    pub fn export(&self, out: &mut dyn std::io::Write) -> Result<usize> {
        let txn = self.store().begin(None).map_err(Error::from)?;
        let mut cursor = txn.cursor(self.id2entry_db()).map_err(Error::from)?;
        let mut exported = 0usize;
        let mut position = cursor.seek(CursorOp::First, None);
        loop {
            let (key, _) = match position {
                Ok(pair) => pair,
                Err(StoreError::NotFound) => break,
                Err(err) => return Err(err.into()),
            };
            let buf: [u8; 4] = key.as_slice().try_into().map_err(|_| {
                Error::Serialization("id2entry key is not a 32-bit ID".into())
            })?;
            let entry = self.fetch_entry_with_dn(&txn, EntryId::from_be_bytes(buf))?;
            if !entry.is_tombstone() && !entry.is_ruv() {
                let line = serde_json::to_string(&entry)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                writeln!(out, "{line}")?;
                exported += 1;
            }
            position = cursor.seek(CursorOp::Next, None);
        }
        txn.abort();
        Ok(exported)
    }

    /// Copies the store snapshots and `DBVERSION` into `dest` while the
    /// instance is fenced busy.
    ///
    /// # Errors
    ///
    /// [`Error::UnwillingToPerform`] for an in-memory instance or when
    /// already busy; I/O failures propagate.
    pub fn backup(&self, dest: &Path) -> Result<()> {
        let Some(dir) = self.dir().map(Path::to_path_buf) else {
            return Err(Error::UnwillingToPerform(
                "in-memory instance cannot be backed up".into(),
            ));
        };
        let fence = BulkFence::acquire(self, &[])?;
        self.sync()?;

        std::fs::create_dir_all(dest)?;
        let mut copied = 0usize;
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            let is_db = path.extension().is_some_and(|ext| ext == "db");
            let is_version = path
                .file_name()
                .is_some_and(|name| name == crate::dbversion::DBVERSION_FILE);
            if is_db || is_version {
                if let Some(name) = path.file_name() {
                    std::fs::copy(&path, dest.join(name))?;
                    copied += 1;
                }
            }
        }
        drop(fence);
        info!(copied, dest = %dest.display(), "backup finished");
        Ok(())
    }

    /// Restores a backup into `dir` and opens the instance from it.
    ///
    /// # Errors
    ///
    /// I/O and open failures propagate.
    pub fn restore(
        dir: impl AsRef<Path>,
        backup: impl AsRef<Path>,
        config: InstanceConfig,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        // Drop whatever the directory held; the backup is authoritative.
        for entry in std::fs::read_dir(dir)?.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "db") {
                std::fs::remove_file(&path)?;
            }
        }
        for entry in std::fs::read_dir(backup.as_ref())?.flatten() {
            let path = entry.path();
            if let Some(name) = path.file_name() {
                std::fs::copy(&path, dir.join(name))?;
            }
        }
        Self::open(dir, config)
    }

    /// Re-derives one attribute's index from `id2entry`: OFFLINE fence,
    /// truncate, re-add every entry's values, release.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an untracked attribute; store failures
    /// propagate. The fences always lift.
    pub fn rebuild_index(&self, attr: &str) -> Result<()> {
        let attr = attr.to_ascii_lowercase();
        if self.attrinfo().get(&attr).is_none() {
            return Err(Error::Config(format!("attribute {attr} is not indexed")));
        }
        let fence = BulkFence::acquire(self, std::slice::from_ref(&attr))?;

        let db = self.index_db(&attr)?;
        self.store().truncate_db(db).map_err(Error::from)?;

        let mut buffer = IndexBuffer::new(&attr, 0);
        let txn = self.store().begin(None).map_err(Error::from)?;
        let mut cursor = txn.cursor(self.id2entry_db()).map_err(Error::from)?;
        let mut position = cursor.seek(CursorOp::First, None);
        loop {
            let (key, _) = match position {
                Ok(pair) => pair,
                Err(StoreError::NotFound) => break,
                Err(err) => return Err(err.into()),
            };
            let buf: [u8; 4] = key.as_slice().try_into().map_err(|_| {
                Error::Serialization("id2entry key is not a 32-bit ID".into())
            })?;
            let id = EntryId::from_be_bytes(buf);
            let entry = self.entry_fetch(&txn, id)?;

            if entry.is_tombstone() {
                // Tombstones keep only their minimal keys.
                let tombstone_value: Option<Vec<u8>> = match attr.as_str() {
                    opattr::OBJECTCLASS => Some(opattr::OC_TOMBSTONE.as_bytes().to_vec()),
                    opattr::NSUNIQUEID => Some(entry.unique_id().as_bytes().to_vec()),
                    opattr::NSCPENTRYDN => {
                        entry.first_value(opattr::NSCPENTRYDN).map(<[u8]>::to_vec)
                    }
                    _ => None,
                };
                if let Some(value) = tombstone_value {
                    buffer.push(keys::eq_key(&crate::entry::value_normalize(&value)), id);
                }
            } else if entry.is_ruv() {
                if attr == opattr::NSUNIQUEID {
                    buffer.push(keys::eq_key(entry.unique_id().as_bytes()), id);
                }
            } else {
                buffer.collect_entry(self, &entry)?;
            }
            position = cursor.seek(CursorOp::Next, None);
        }

        // Collect while OFFLINE, but flush with the fence down: the
        // buffer writes keys directly, and collect_entry consults only
        // the mask.
        buffer.flush(self, &txn)?;
        txn.commit().map_err(Error::from)?;
        drop(fence);
        debug!(attr = %attr, "index rebuilt");

        if attr == "ancestorid" {
            self.ancestorid_create_index()?;
        }
        Ok(())
    }

    /// Re-runs the on-disk layout check, applying the rename-pass upgrade
    /// when the directory is one major behind.
    ///
    /// # Errors
    ///
    /// [`Error::UnwillingToPerform`] for an in-memory instance; version
    /// failures propagate.
    pub fn upgrade(&self) -> Result<()> {
        let Some(dir) = self.dir() else {
            return Err(Error::UnwillingToPerform(
                "in-memory instance has no on-disk layout".into(),
            ));
        };
        DbVersion::check_or_init(dir, self.config().idl_switch)
    }
}
