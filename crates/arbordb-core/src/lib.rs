//! # `ArborDB` Core
//!
//! An embedded directory-entry storage engine: entries with distinguished
//! names and multi-valued attributes, persisted on an ordered key/value
//! substrate, with the relational machinery a directory server needs on
//! every write.
//!
//! ## What lives here
//!
//! - **ID lists** ([`idl`]): the compressed set-of-IDs primitive under
//!   every index, with an AllIds sentinel, two on-disk encodings, and a
//!   k-way set engine for compound filters.
//! - **Attribute indexes** ([`index`]): presence, equality, approximate,
//!   substring and matching-rule indexes, keyed by prefixed values, with
//!   per-attribute configuration and optional value encryption.
//! - **Hierarchy indexes** ([`ancestor`], [`dnindex`]): direct-parent and
//!   transitive-ancestor tables, plus two DN↔ID representations (one of
//!   which makes subtree renames pointer updates).
//! - **Mutation operations** ([`ops`]): add, modify, delete and modrdn
//!   under a deadlock-retry transaction envelope, with tombstones,
//!   resurrection, and replication-state piggybacking.
//! - **The entry cache** ([`cache`]): triple-keyed (ID / DN / unique ID),
//!   LRU-bounded, with tentative-add and replace-on-commit protocols.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use arbordb_core::{Dn, Entry, Filter, Instance, InstanceConfig, OpContext, Scope};
//!
//! let instance = Instance::open("./data", InstanceConfig::load(None)?)?;
//! let ctx = OpContext::new();
//!
//! let mut entry = Entry::new(Dn::parse("cn=a,o=example")?);
//! entry.add_values("objectclass", &[b"person".to_vec()])?;
//! entry.add_values("cn", &[b"a".to_vec()])?;
//! instance.add(&ctx, entry)?;
//!
//! instance.search(&ctx, &Dn::parse("o=example")?, Scope::Subtree,
//!     &Filter::eq("cn", b"a"), |entry| { println!("{}", entry.dn()); Ok(()) })?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod ancestor;
pub mod cache;
pub mod config;
pub mod crypt;
pub mod dbversion;
pub mod dnindex;
pub mod entry;
pub mod error;
pub mod filter;
pub mod id;
pub mod idl;
pub mod index;
pub mod instance;
pub mod ops;
pub mod parents;
pub mod plugin;
pub mod sort;
pub mod store;
pub mod txn;

pub use config::InstanceConfig;
pub use entry::{Attribute, Csn, Dn, Entry, Mod, ModOp};
pub use error::{Error, Result};
pub use filter::Filter;
pub use id::{EntryId, MAXID, NOID};
pub use idl::{IdList, IdListSet, IdlKind};
pub use instance::Instance;
pub use ops::seq::SeqType;
pub use ops::Scope;
pub use txn::OpContext;
