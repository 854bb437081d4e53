//! DN ↔ ID resolution.
//!
//! Two representations, selected by the `subtree_rename` switch:
//!
//! - **Flat (`entrydn`)**: every entry's normalized DN is an equality key
//!   in the `entrydn` index. Simple, but a subtree rename must rewrite one
//!   key per descendant.
//! - **Tree (`entryrdn`)**: a dedicated table stores one node per entry
//!   (`N<id>` → parent pointer + own RDN) and one downward link
//!   (`C<parent-id><rdn>` → id). DNs are derived by walking pointers, so a
//!   subtree rename touches only the moved apex. The stored entry's DN can
//!   therefore be stale on disk; [`Instance::fetch_entry_with_dn`] is the
//!   read path that repairs it.
//!
//! The suffix entry links under [`NOID`] with its full suffix string as
//! the RDN, which keeps multi-component suffixes one lookup.

use serde::{Deserialize, Serialize};

use crate::entry::{opattr, Dn, Entry};
use crate::error::{Error, Result};
use crate::id::{EntryId, NOID};
use crate::index::keys;
use crate::instance::Instance;
use crate::store::{StoreError, Txn};

/// One node of the DN tree table.
#[derive(Debug, Serialize, Deserialize)]
struct RdnNode {
    parent: EntryId,
    rdn: String,
}

fn node_key(id: EntryId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(b'N');
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn child_key(parent: EntryId, rdn: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(6 + rdn.len());
    key.push(b'C');
    key.extend_from_slice(&parent.to_be_bytes());
    key.extend_from_slice(rdn.as_bytes());
    key.push(0);
    key
}

impl Instance {
    /// Resolves a normalized DN to its entry ID, in whichever
    /// representation is active. `None` when no such entry exists (or the
    /// DN lies outside the suffix).
    ///
    /// # Errors
    ///
    /// Store failures propagate.
    pub fn dn2id(&self, txn: &Txn, dn: &Dn) -> Result<Option<EntryId>> {
        if self.config().subtree_rename {
            self.tree_dn2id(txn, dn)
        } else {
            let db = self.index_db(opattr::ENTRYDN)?;
            let key = keys::eq_key(dn.as_str().as_bytes());
            let idl = self
                .config()
                .idl_switch
                .fetch(txn, db, &key, self.next_id_value())?;
            Ok(idl.and_then(|idl| idl.first_id()))
        }
    }

    fn tree_dn2id(&self, txn: &Txn, dn: &Dn) -> Result<Option<EntryId>> {
        let db = self.entryrdn_db()?;
        let lookup = |parent: EntryId, rdn: &str| -> Result<Option<EntryId>> {
            match txn.get(db, &child_key(parent, rdn)) {
                Ok(bytes) => {
                    let buf: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                        Error::Serialization("entryrdn child record is not an ID".into())
                    })?;
                    Ok(Some(EntryId::from_be_bytes(buf)))
                }
                Err(StoreError::NotFound) => Ok(None),
                Err(err) => Err(err.into()),
            }
        };

        let suffix = Dn::parse(&self.config().suffix)?;
        let comps = dn.components();
        let (head, rel) = if suffix.is_root() {
            let Some((last, rest)) = comps.split_last() else {
                return Ok(None);
            };
            (lookup(NOID, last)?, rest)
        } else {
            if !dn.is_below(&suffix) {
                return Ok(None);
            }
            let rel = &comps[..comps.len() - suffix.depth()];
            (lookup(NOID, suffix.as_str())?, rel)
        };
        let Some(mut current) = head else {
            return Ok(None);
        };
        for comp in rel.iter().rev() {
            match lookup(current, comp)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Derives the current DN of `id` from the tree table. `None` when the
    /// entry has no node (flat mode never needs this).
    ///
    /// # Errors
    ///
    /// Store failures propagate.
    pub fn id2dn(&self, txn: &Txn, id: EntryId) -> Result<Option<Dn>> {
        let db = self.entryrdn_db()?;
        let mut parts: Vec<String> = Vec::new();
        let mut current = id;
        loop {
            let node: RdnNode = match txn.get(db, &node_key(current)) {
                Ok(bytes) => bincode::deserialize(&bytes)
                    .map_err(|e| Error::Serialization(e.to_string()))?,
                Err(StoreError::NotFound) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            parts.push(node.rdn);
            if node.parent == NOID {
                break;
            }
            current = node.parent;
        }
        Ok(Some(Dn::parse(&parts.join(","))?))
    }

    /// Records the DN of a new entry. In tree mode this writes the node
    /// and downward link; in flat mode the generic index path already
    /// covers the `entrydn` attribute and this is a no-op.
    ///
    /// # Errors
    ///
    /// Store failures propagate.
    pub fn dn_link_add(
        &self,
        txn: &Txn,
        entry: &Entry,
        parent_id: Option<EntryId>,
    ) -> Result<()> {
        if !self.config().subtree_rename {
            return Ok(());
        }
        let db = self.entryrdn_db()?;
        let (parent, rdn) = match parent_id {
            Some(pid) => (
                pid,
                entry
                    .dn()
                    .rdn()
                    .ok_or_else(|| Error::InvalidDnSyntax(entry.dn().to_string()))?
                    .to_string(),
            ),
            None => (NOID, entry.dn().as_str().to_string()),
        };
        let node = RdnNode { parent, rdn };
        let bytes =
            bincode::serialize(&node).map_err(|e| Error::Serialization(e.to_string()))?;
        txn.put(db, &node_key(entry.id()), &bytes)?;
        txn.put(db, &child_key(parent, &node.rdn), &entry.id().to_be_bytes())?;
        Ok(())
    }

    /// Removes the DN records of a deleted entry (tree mode).
    ///
    /// # Errors
    ///
    /// Store failures propagate; missing records are fine.
    pub fn dn_link_remove(&self, txn: &Txn, entry: &Entry) -> Result<()> {
        if !self.config().subtree_rename {
            return Ok(());
        }
        let db = self.entryrdn_db()?;
        let node: Option<RdnNode> = match txn.get(db, &node_key(entry.id())) {
            Ok(bytes) => Some(
                bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))?,
            ),
            Err(StoreError::NotFound) => None,
            Err(err) => return Err(err.into()),
        };
        let Some(node) = node else {
            return Ok(());
        };
        match txn.del(db, &node_key(entry.id())) {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        match txn.del(db, &child_key(node.parent, &node.rdn)) {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// The pointer-style subtree move: rewrites the apex node's parent
    /// link and RDN. Descendant nodes are untouched; their DNs derive
    /// through the apex.
    ///
    /// # Errors
    ///
    /// [`Error::Operations`] when the apex has no node; store failures
    /// propagate.
    pub fn dn_link_move(
        &self,
        txn: &Txn,
        id: EntryId,
        new_parent: Option<EntryId>,
        new_rdn: &str,
    ) -> Result<()> {
        let db = self.entryrdn_db()?;
        let node: RdnNode = match txn.get(db, &node_key(id)) {
            Ok(bytes) => {
                bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))?
            }
            Err(StoreError::NotFound) => {
                return Err(Error::Operations(format!("no DN tree node for id {id}")))
            }
            Err(err) => return Err(err.into()),
        };
        txn.del(db, &child_key(node.parent, &node.rdn))
            .map_err(Error::from)?;
        let parent = new_parent.unwrap_or(NOID);
        let updated = RdnNode {
            parent,
            rdn: new_rdn.to_ascii_lowercase(),
        };
        let bytes =
            bincode::serialize(&updated).map_err(|e| Error::Serialization(e.to_string()))?;
        txn.put(db, &node_key(id), &bytes)?;
        txn.put(db, &child_key(parent, &updated.rdn), &id.to_be_bytes())?;
        Ok(())
    }

    /// Fetches an entry with its DN authoritative: in tree mode the DN is
    /// re-derived from the table (the stored copy may predate a subtree
    /// move) and the `entrydn` attribute refreshed.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchObject`] when the row does not exist.
    pub fn fetch_entry_with_dn(&self, txn: &Txn, id: EntryId) -> Result<Entry> {
        let mut entry = self.entry_fetch(txn, id)?;
        if self.config().subtree_rename {
            if let Some(dn) = self.id2dn(txn, id)? {
                if &dn != entry.dn() {
                    entry.set_dn(dn.clone());
                    entry.set_single_str(opattr::ENTRYDN, dn.as_str());
                }
            }
        }
        Ok(entry)
    }
}
