//! Directory entries: attributes, modifications, tombstone forms.
//!
//! An entry is a set of (attribute type, multi-valued byte strings) plus
//! the bookkeeping the engine maintains: internal ID, normalized DN, unique
//! ID, and the operational attributes `entryid`, `parentid`, `entrydn`,
//! `numsubordinates`, `hassubordinates`. Entries serialize to the
//! `id2entry` database with bincode.
//!
//! Attribute names may carry subtypes (`cn;lang-en`); index maintenance and
//! value-presence checks work on the base type, which is why several
//! methods here take "base type" arguments.

mod dn;


pub use dn::Dn;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::id::{EntryId, NOID};

/// Operational attribute names maintained by the engine.
pub mod opattr {
    /// Internal entry ID.
    pub const ENTRYID: &str = "entryid";
    /// Internal ID of the parent entry.
    pub const PARENTID: &str = "parentid";
    /// Normalized DN, stored redundantly for the `entrydn` index.
    pub const ENTRYDN: &str = "entrydn";
    /// Number of direct children.
    pub const NUMSUBORDINATES: &str = "numsubordinates";
    /// Whether the entry has children.
    pub const HASSUBORDINATES: &str = "hassubordinates";
    /// The entry's unique identifier.
    pub const NSUNIQUEID: &str = "nsuniqueid";
    /// Unique identifier of the parent, carried by tombstones instead of
    /// `parentid`.
    pub const NSPARENTUNIQUEID: &str = "nsparentuniqueid";
    /// DN recorded on tombstones for replication.
    pub const NSCPENTRYDN: &str = "nscpentrydn";
    /// Object class attribute.
    pub const OBJECTCLASS: &str = "objectclass";
    /// Object class marking a tombstone.
    pub const OC_TOMBSTONE: &str = "nstombstone";
    /// Object class marking a resurrection glue entry.
    pub const OC_GLUE: &str = "glue";
}

/// Change sequence number attached to state-carrying modifications.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Csn(pub String);

impl std::fmt::Display for Csn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One attribute: a (possibly subtyped) name and its values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Normalized (lowercased) name, subtypes included.
    pub name: String,
    /// Attribute values as raw byte strings.
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    /// The name up to the first subtype separator.
    #[must_use]
    pub fn base_type(&self) -> &str {
        self.name.split(';').next().unwrap_or(&self.name)
    }
}

/// Case-insensitive value comparison, the default matching for directory
/// strings.
#[must_use]
pub fn value_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.eq_ignore_ascii_case(y))
}

/// Normalized (case-folded) form of a value, used for index keys.
#[must_use]
pub fn value_normalize(value: &[u8]) -> Vec<u8> {
    value.to_ascii_lowercase()
}

/// A directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    dn: Dn,
    id: EntryId,
    unique_id: String,
    attrs: Vec<Attribute>,
    tombstone: bool,
    ruv: bool,
    /// Latest CSN seen per base attribute type, for state-carrying mods.
    attr_csns: HashMap<String, Csn>,
}

impl Entry {
    /// Creates an empty entry at `dn` with a fresh unique ID.
    #[must_use]
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            id: NOID,
            unique_id: uuid::Uuid::new_v4().to_string(),
            attrs: Vec::new(),
            tombstone: false,
            ruv: false,
            attr_csns: HashMap::new(),
        }
    }

    /// The normalized DN.
    #[must_use]
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Rewrites the DN (modrdn and tombstone paths).
    pub fn set_dn(&mut self, dn: Dn) {
        self.dn = dn;
    }

    /// The internal ID ([`NOID`] until assigned).
    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Assigns the internal ID.
    pub fn set_id(&mut self, id: EntryId) {
        self.id = id;
    }

    /// The unique identifier string.
    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Overrides the unique identifier (replication supplies these).
    pub fn set_unique_id(&mut self, unique_id: String) {
        self.unique_id = unique_id;
    }

    /// True for tombstoned (logically deleted) entries.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// True for the special replication-state entry.
    #[must_use]
    pub fn is_ruv(&self) -> bool {
        self.ruv
    }

    /// Marks this entry as the replication-state entry.
    pub fn set_ruv(&mut self, ruv: bool) {
        self.ruv = ruv;
    }

    /// Sets the tombstone flag directly (replicated tombstone adds arrive
    /// already flagged).
    pub fn set_tombstone(&mut self, tombstone: bool) {
        self.tombstone = tombstone;
    }

    /// All attributes.
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attrs
    }

    /// The attribute with exactly this (normalized) name.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        let name = name.to_ascii_lowercase();
        self.attrs.iter().find(|a| a.name == name)
    }

    /// Every value stored under `base` across all subtypes.
    #[must_use]
    pub fn values_of_base(&self, base: &str) -> Vec<&[u8]> {
        let base = base.to_ascii_lowercase();
        self.attrs
            .iter()
            .filter(|a| a.base_type() == base)
            .flat_map(|a| a.values.iter().map(Vec::as_slice))
            .collect()
    }

    /// True when `value` exists under `base`, any subtype.
    #[must_use]
    pub fn has_value(&self, base: &str, value: &[u8]) -> bool {
        self.values_of_base(base)
            .iter()
            .any(|v| value_eq(v, value))
    }

    /// First value of the exactly-named attribute.
    #[must_use]
    pub fn first_value(&self, name: &str) -> Option<&[u8]> {
        self.attr(name)
            .and_then(|a| a.values.first())
            .map(Vec::as_slice)
    }

    /// First value rendered as UTF-8, if it is.
    #[must_use]
    pub fn first_value_str(&self, name: &str) -> Option<&str> {
        self.first_value(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// True when the entry carries this objectclass value.
    #[must_use]
    pub fn has_objectclass(&self, oc: &str) -> bool {
        self.has_value(opattr::OBJECTCLASS, oc.as_bytes())
    }

    /// Adds values under `name`, creating the attribute on first use.
    ///
    /// # Errors
    ///
    /// [`Error::TypeOrValueExists`] when a value is already present.
    pub fn add_values(&mut self, name: &str, values: &[Vec<u8>]) -> Result<()> {
        let name = name.to_ascii_lowercase();
        for value in values {
            let base = name.split(';').next().unwrap_or(&name).to_string();
            if self.has_value(&base, value) {
                return Err(Error::TypeOrValueExists(name.clone()));
            }
            match self.attrs.iter_mut().find(|a| a.name == name) {
                Some(attr) => attr.values.push(value.clone()),
                None => self.attrs.push(Attribute {
                    name: name.clone(),
                    values: vec![value.clone()],
                }),
            }
        }
        Ok(())
    }

    /// Replaces the attribute's values wholesale; an empty list removes it.
    pub fn replace_values(&mut self, name: &str, values: &[Vec<u8>]) {
        let name = name.to_ascii_lowercase();
        self.attrs.retain(|a| a.name != name);
        if !values.is_empty() {
            self.attrs.push(Attribute {
                name,
                values: values.to_vec(),
            });
        }
    }

    /// Deletes values (or the whole attribute when `values` is empty).
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchAttribute`] when the attribute or a named value is
    /// absent.
    pub fn delete_values(&mut self, name: &str, values: &[Vec<u8>]) -> Result<()> {
        let name = name.to_ascii_lowercase();
        let Some(at) = self.attrs.iter().position(|a| a.name == name) else {
            return Err(Error::NoSuchAttribute(name));
        };
        if values.is_empty() {
            self.attrs.remove(at);
            return Ok(());
        }
        for value in values {
            let attr = &mut self.attrs[at];
            let Some(vat) = attr.values.iter().position(|v| value_eq(v, value)) else {
                return Err(Error::NoSuchAttribute(name));
            };
            attr.values.remove(vat);
        }
        if self.attrs[at].values.is_empty() {
            self.attrs.remove(at);
        }
        Ok(())
    }

    /// Sets a single-valued string attribute, replacing prior values.
    pub fn set_single_str(&mut self, name: &str, value: &str) {
        self.replace_values(name, &[value.as_bytes().to_vec()]);
    }

    /// Removes an attribute without error when absent.
    pub fn remove_attr(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.attrs.retain(|a| a.name != name);
    }

    /// The parent ID recorded in the operational attributes.
    #[must_use]
    pub fn parent_id(&self) -> Option<EntryId> {
        self.first_value_str(opattr::PARENTID)
            .and_then(|v| v.parse::<u32>().ok())
            .map(EntryId)
    }

    /// Materializes `entryid`, `parentid` and `entrydn` from the given IDs.
    pub fn set_bookkeeping(&mut self, id: EntryId, parent: Option<EntryId>) {
        self.id = id;
        self.set_single_str(opattr::ENTRYID, &id.to_string());
        match parent {
            Some(pid) => self.set_single_str(opattr::PARENTID, &pid.to_string()),
            None => self.remove_attr(opattr::PARENTID),
        }
        let dn = self.dn.as_str().to_string();
        self.set_single_str(opattr::ENTRYDN, &dn);
        let unique_id = self.unique_id.clone();
        self.set_single_str(opattr::NSUNIQUEID, &unique_id);
    }

    /// The CSN last applied to `base`, if any.
    #[must_use]
    pub fn attr_csn(&self, base: &str) -> Option<&Csn> {
        self.attr_csns.get(&base.to_ascii_lowercase())
    }

    /// Applies `mods` in order. With `csn` set the application is
    /// state-carrying: each touched base type records the CSN.
    ///
    /// # Errors
    ///
    /// Propagates the per-mod errors of [`Entry::add_values`] and
    /// [`Entry::delete_values`].
    pub fn apply_mods(&mut self, mods: &[Mod], csn: Option<&Csn>) -> Result<()> {
        for m in mods {
            match m.op {
                ModOp::Add => self.add_values(&m.attr, &m.values)?,
                ModOp::Delete => self.delete_values(&m.attr, &m.values)?,
                ModOp::Replace => self.replace_values(&m.attr, &m.values),
            }
            if let Some(csn) = csn {
                let base = m
                    .attr
                    .split(';')
                    .next()
                    .unwrap_or(&m.attr)
                    .to_ascii_lowercase();
                self.attr_csns.insert(base, csn.clone());
            }
        }
        Ok(())
    }

    /// Converts this entry to its tombstone form: DN becomes
    /// `nsuniqueid=<uid>,<old dn>`, the tombstone objectclass is added, the
    /// original DN is preserved in `nscpentrydn`, and parentage moves from
    /// `parentid` to `nsparentuniqueid`.
    #[must_use]
    pub fn to_tombstone(&self, parent_unique_id: Option<&str>) -> Self {
        let mut stone = self.clone();
        stone.tombstone = true;
        stone.set_single_str(opattr::NSCPENTRYDN, self.dn.as_str());
        let tomb_dn = self
            .dn
            .child(&format!("{}={}", opattr::NSUNIQUEID, self.unique_id));
        stone.set_dn(tomb_dn.clone());
        stone.set_single_str(opattr::ENTRYDN, tomb_dn.as_str());
        if !stone.has_objectclass(opattr::OC_TOMBSTONE) {
            let _ = stone.add_values(
                opattr::OBJECTCLASS,
                &[opattr::OC_TOMBSTONE.as_bytes().to_vec()],
            );
        }
        stone.remove_attr(opattr::PARENTID);
        match parent_unique_id {
            Some(uid) => stone.set_single_str(opattr::NSPARENTUNIQUEID, uid),
            None => stone.remove_attr(opattr::NSPARENTUNIQUEID),
        }
        stone
    }

    /// Reverses [`Entry::to_tombstone`] for resurrection: restores the DN,
    /// strips the tombstone markers, and tags the entry as glue.
    ///
    /// # Errors
    ///
    /// [`Error::Operations`] when the tombstone lacks its recorded DN.
    pub fn resurrect(&self, csn: Option<&Csn>) -> Result<Self> {
        let original = self
            .first_value_str(opattr::NSCPENTRYDN)
            .ok_or_else(|| Error::Operations("tombstone has no recorded DN".into()))?;
        let dn = Dn::parse(original)?;
        let mut back = self.clone();
        back.tombstone = false;
        back.set_dn(dn.clone());
        back.set_single_str(opattr::ENTRYDN, dn.as_str());
        back.remove_attr(opattr::NSCPENTRYDN);
        back.remove_attr(opattr::NSPARENTUNIQUEID);
        let _ = back.delete_values(
            opattr::OBJECTCLASS,
            &[opattr::OC_TOMBSTONE.as_bytes().to_vec()],
        );
        if !back.has_objectclass(opattr::OC_GLUE) {
            back.add_values(opattr::OBJECTCLASS, &[opattr::OC_GLUE.as_bytes().to_vec()])?;
        }
        if let Some(csn) = csn {
            back.attr_csns
                .insert(opattr::OBJECTCLASS.to_string(), csn.clone());
        }
        Ok(back)
    }

    /// Rough in-memory footprint, used for cache accounting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let values: usize = self
            .attrs
            .iter()
            .map(|a| a.name.len() + a.values.iter().map(Vec::len).sum::<usize>())
            .sum();
        std::mem::size_of::<Self>() + self.dn.as_str().len() + self.unique_id.len() + values
    }

    /// Serializes for `id2entry` storage.
    ///
    /// # Errors
    ///
    /// Propagates bincode failures.
    pub fn to_stored(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Error::from)
    }

    /// Inverse of [`Entry::to_stored`].
    ///
    /// # Errors
    ///
    /// Propagates bincode failures.
    pub fn from_stored(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Error::from)
    }
}

/// Modification operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    /// Add values to an attribute.
    Add,
    /// Delete listed values, or the attribute when no values are listed.
    Delete,
    /// Replace the attribute's values wholesale.
    Replace,
}

/// One modification of one attribute.
#[derive(Debug, Clone)]
pub struct Mod {
    /// Operator.
    pub op: ModOp,
    /// Target attribute (subtypes allowed).
    pub attr: String,
    /// Values the operator applies to.
    pub values: Vec<Vec<u8>>,
}

impl Mod {
    /// Convenience constructor normalizing the attribute name.
    #[must_use]
    pub fn new(op: ModOp, attr: &str, values: Vec<Vec<u8>>) -> Self {
        Self {
            op,
            attr: attr.to_ascii_lowercase(),
            values,
        }
    }
}
