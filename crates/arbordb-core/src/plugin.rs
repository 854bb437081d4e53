//! Typed plugin dispatch.
//!
//! The engine exposes a fixed set of hook points instead of a generic
//! callback bus: pre-operation, post-operation, transaction-pre and
//! transaction-post for each mutation, plus matching-rule indexers (the
//! values-to-keys hook) and the attribute-encryption providers registered
//! in [`crate::index::attrinfo`]. Every operation plugin answers with a
//! three-valued verdict.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::entry::{Dn, Entry};
use crate::error::{Error, Result};

/// What a plugin decided about an operation.
pub enum PluginVerdict {
    /// Proceed.
    Ok,
    /// Treat the operation as already done: commit as success without
    /// writing.
    Noop,
    /// Veto the operation with this error.
    Fail(Error),
}

/// Which mutation is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Entry add.
    Add,
    /// Entry modify.
    Modify,
    /// Entry delete.
    Delete,
    /// Entry rename / move.
    Modrdn,
}

/// The operation snapshot handed to plugins.
pub struct OpInfo<'a> {
    /// Which mutation.
    pub kind: OpKind,
    /// Target DN.
    pub dn: &'a Dn,
    /// The entry image relevant at this hook (new entry for add, post
    /// image for modify, old entry for delete).
    pub entry: Option<&'a Entry>,
}

/// An operation plugin; the same shape serves all four hook points.
pub trait OpPlugin: Send + Sync {
    /// Examines the operation and votes.
    fn invoke(&self, op: &OpInfo<'_>) -> PluginVerdict;
}

/// A matching-rule indexer: derives index key material from values.
pub trait MatchingRuleIndexer: Send + Sync {
    /// The matching rule OID this indexer serves.
    fn oid(&self) -> &str;

    /// Derived key bytes for one value (may be empty: nothing to index).
    fn keys(&self, value: &[u8]) -> Vec<Vec<u8>>;
}

/// Where an operation plugin is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Before the transaction starts real work.
    PreOp,
    /// After commit, outside the transaction.
    PostOp,
    /// Inside the transaction, before the writes.
    TxnPre,
    /// Inside the transaction, after the writes.
    TxnPost,
}

impl HookPoint {
    const fn name(self) -> &'static str {
        match self {
            Self::PreOp => "pre-op",
            Self::PostOp => "post-op",
            Self::TxnPre => "txn-pre",
            Self::TxnPost => "txn-post",
        }
    }
}

#[derive(Default)]
struct Hooks {
    pre_op: Vec<Box<dyn OpPlugin>>,
    post_op: Vec<Box<dyn OpPlugin>>,
    txn_pre: Vec<Box<dyn OpPlugin>>,
    txn_post: Vec<Box<dyn OpPlugin>>,
}

/// The instance's plugin table.
#[derive(Default)]
pub struct PluginRegistry {
    hooks: RwLock<Hooks>,
    indexers: RwLock<FxHashMap<String, Box<dyn MatchingRuleIndexer>>>,
}

impl PluginRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an operation plugin at `point`.
    pub fn register(&self, point: HookPoint, plugin: Box<dyn OpPlugin>) {
        let mut hooks = self.hooks.write();
        match point {
            HookPoint::PreOp => hooks.pre_op.push(plugin),
            HookPoint::PostOp => hooks.post_op.push(plugin),
            HookPoint::TxnPre => hooks.txn_pre.push(plugin),
            HookPoint::TxnPost => hooks.txn_post.push(plugin),
        }
    }

    /// Registers a matching-rule indexer under its OID.
    pub fn register_indexer(&self, indexer: Box<dyn MatchingRuleIndexer>) {
        self.indexers
            .write()
            .insert(indexer.oid().to_string(), indexer);
    }

    /// Derives matching-rule keys for `value` under `oid`; empty when no
    /// indexer is registered.
    #[must_use]
    pub fn rule_keys(&self, oid: &str, value: &[u8]) -> Vec<Vec<u8>> {
        self.indexers
            .read()
            .get(oid)
            .map(|indexer| indexer.keys(value))
            .unwrap_or_default()
    }

    /// Runs every plugin at `point`. Returns `Ok(true)` when one voted
    /// NOOP; the caller commits as success without writing.
    ///
    /// # Errors
    ///
    /// The first veto propagates as [`Error::PluginVeto`] (or unchanged
    /// when the plugin supplied a specific engine error).
    pub fn run(&self, point: HookPoint, op: &OpInfo<'_>) -> Result<bool> {
        let hooks = self.hooks.read();
        let list = match point {
            HookPoint::PreOp => &hooks.pre_op,
            HookPoint::PostOp => &hooks.post_op,
            HookPoint::TxnPre => &hooks.txn_pre,
            HookPoint::TxnPost => &hooks.txn_post,
        };
        for plugin in list {
            match plugin.invoke(op) {
                PluginVerdict::Ok => {}
                PluginVerdict::Noop => return Ok(true),
                PluginVerdict::Fail(Error::Operations(message)) => {
                    return Err(Error::PluginVeto {
                        hook: point.name(),
                        message,
                    })
                }
                PluginVerdict::Fail(err) => return Err(err),
            }
        }
        Ok(false)
    }
}
