//! The modify operation.
//!
//! Mods are applied twice before anything is written: once to a scratch
//! image to validate them plainly, once with CSN propagation to produce
//! the state-carrying post-image. The post-image is re-checked (an entry
//! must keep an objectclass), stored, and the indexes updated from the
//! pre/post difference.

use tracing::debug;

use crate::entry::{opattr, Dn, Mod};
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::plugin::{HookPoint, OpInfo, OpKind};
use crate::txn::OpContext;

impl Instance {
    /// Applies `mods` to the entry at `dn`.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchObject`] for an unknown DN, the per-mod errors of
    /// value application, [`Error::ObjectClassViolation`] when the
    /// post-image loses its objectclass, [`Error::Busy`] on retry
    /// exhaustion, plus store failures.
    pub fn modify(&self, ctx: &OpContext, dn: &Dn, mods: &[Mod]) -> Result<()> {
        self.check_writable()?;

        let old_entry = {
            let probe = self.store().begin(None).map_err(Error::from)?;
            let found = self.dn2entry(&probe, dn)?;
            probe.abort();
            found.ok_or_else(|| Error::NoSuchObject(dn.to_string()))?
        };
        let id = old_entry.id();

        {
            let info = OpInfo {
                kind: OpKind::Modify,
                dn,
                entry: Some(&old_entry),
            };
            if self.plugins().run(HookPoint::PreOp, &info)? {
                return Ok(());
            }
        }

        let entry_lock = self.cache().entry_lock(id);
        let _entry_guard = entry_lock.lock();

        // First application: plain, to validate the mods.
        let mut scratch = old_entry.clone();
        scratch.apply_mods(mods, None)?;
        // Second application: state-carrying.
        let mut new_entry = old_entry.clone();
        new_entry.apply_mods(mods, ctx.csn())?;

        if new_entry.attr(opattr::OBJECTCLASS).is_none() {
            return Err(Error::ObjectClassViolation(dn.to_string()));
        }

        let touched: Vec<String> = mods.iter().map(|m| m.attr.clone()).collect();
        let saved_old = old_entry;
        let saved_new = new_entry;
        let result = self.run_write(|txn| {
            let info = OpInfo {
                kind: OpKind::Modify,
                dn,
                entry: Some(&saved_new),
            };
            self.plugins().run(HookPoint::TxnPre, &info)?;

            self.entry_store(txn, &saved_new)?;
            self.index_entry_delta(txn, &saved_old, &saved_new, &touched)?;
            self.ruv_piggyback(txn, ctx.csn())?;

            self.plugins().run(HookPoint::TxnPost, &info)?;
            Ok(())
        });

        match result {
            Ok(()) => {
                drop(self.cache().replace(id, saved_new.clone()));
                let info = OpInfo {
                    kind: OpKind::Modify,
                    dn,
                    entry: Some(&saved_new),
                };
                let _ = self.plugins().run(HookPoint::PostOp, &info);
                debug!(%id, mods = mods.len(), "entry modified");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
