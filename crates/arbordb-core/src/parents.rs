//! Parent bookkeeping on child changes.
//!
//! When a child is added, deleted, or moved, the parent's
//! `numsubordinates` is recomputed from its current cached value: an
//! absent attribute incremented becomes `add "1"`, a value of 1
//! decremented deletes the attribute outright, anything else is a
//! replace. `hassubordinates` follows as TRUE/absent.

use crate::entry::{opattr, Entry, Mod, ModOp};
use crate::error::{Error, Result};

/// Which way the child population changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildChange {
    /// A child entry was added under the parent.
    Added,
    /// A child entry was removed from under the parent.
    Removed,
}

/// Computes and applies the `numsubordinates` delta on `parent`,
/// returning the subordinate count after the change.
///
/// # Errors
///
/// [`Error::Operations`] when a child is removed from a parent with no
/// recorded subordinates (the indexes are inconsistent).
pub fn parent_update_on_childchange(
    parent: &mut Entry,
    change: ChildChange,
) -> Result<usize> {
    let current: Option<usize> = parent
        .first_value_str(opattr::NUMSUBORDINATES)
        .and_then(|v| v.parse().ok());

    let mods = match (change, current) {
        (ChildChange::Added, None) => vec![Mod::new(
            ModOp::Add,
            opattr::NUMSUBORDINATES,
            vec![b"1".to_vec()],
        )],
        (ChildChange::Added, Some(count)) => vec![Mod::new(
            ModOp::Replace,
            opattr::NUMSUBORDINATES,
            vec![(count + 1).to_string().into_bytes()],
        )],
        (ChildChange::Removed, None | Some(0)) => {
            return Err(Error::Operations(format!(
                "numsubordinates underflow on {}",
                parent.dn()
            )));
        }
        (ChildChange::Removed, Some(1)) => {
            vec![Mod::new(ModOp::Delete, opattr::NUMSUBORDINATES, vec![])]
        }
        (ChildChange::Removed, Some(count)) => vec![Mod::new(
            ModOp::Replace,
            opattr::NUMSUBORDINATES,
            vec![(count - 1).to_string().into_bytes()],
        )],
    };
    parent.apply_mods(&mods, None)?;

    let updated = match change {
        ChildChange::Added => current.unwrap_or(0) + 1,
        ChildChange::Removed => current.unwrap_or(1) - 1,
    };
    if updated > 0 {
        parent.set_single_str(opattr::HASSUBORDINATES, "TRUE");
    } else {
        parent.remove_attr(opattr::HASSUBORDINATES);
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Dn;

    fn parent() -> Entry {
        Entry::new(Dn::parse("ou=people,o=x").unwrap())
    }

    #[test]
    fn first_child_adds_the_attribute() {
        let mut p = parent();
        let count = parent_update_on_childchange(&mut p, ChildChange::Added).unwrap();
        assert_eq!(count, 1);
        assert_eq!(p.first_value_str(opattr::NUMSUBORDINATES), Some("1"));
        assert_eq!(p.first_value_str(opattr::HASSUBORDINATES), Some("TRUE"));
    }

    #[test]
    fn counts_move_by_one() {
        let mut p = parent();
        parent_update_on_childchange(&mut p, ChildChange::Added).unwrap();
        parent_update_on_childchange(&mut p, ChildChange::Added).unwrap();
        assert_eq!(p.first_value_str(opattr::NUMSUBORDINATES), Some("2"));

        parent_update_on_childchange(&mut p, ChildChange::Removed).unwrap();
        assert_eq!(p.first_value_str(opattr::NUMSUBORDINATES), Some("1"));
    }

    #[test]
    fn last_child_removes_the_attribute() {
        let mut p = parent();
        parent_update_on_childchange(&mut p, ChildChange::Added).unwrap();
        let count = parent_update_on_childchange(&mut p, ChildChange::Removed).unwrap();
        assert_eq!(count, 0);
        assert!(p.attr(opattr::NUMSUBORDINATES).is_none());
        assert!(p.attr(opattr::HASSUBORDINATES).is_none());
    }

    #[test]
    fn underflow_is_an_invariant_violation() {
        let mut p = parent();
        assert!(parent_update_on_childchange(&mut p, ChildChange::Removed).is_err());
    }
}
