//! The `DBVERSION` file and the upgrade pass.
//!
//! Each instance directory carries a one-line `DBVERSION` file recording
//! the implementation name, the on-disk layout version, and the IDL
//! encoding: `arbordb/<major>.<minor>/<idl-kind>`. Opening an instance
//! whose file is one major version behind on the 3→4 axis triggers the
//! rename pass (index snapshots moved from the `.db3` suffix to `.db`);
//! anything else that mismatches refuses to open.

use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};
use crate::idl::IdlKind;

/// Name of the version file inside the instance directory.
pub const DBVERSION_FILE: &str = "DBVERSION";

/// Implementation tag written by this engine.
pub const IMPL_NAME: &str = "arbordb";

/// Current on-disk layout version.
pub const CURRENT_MAJOR: u32 = 4;
/// Current on-disk layout minor version.
pub const CURRENT_MINOR: u32 = 0;

/// Parsed contents of a `DBVERSION` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbVersion {
    /// Implementation tag.
    pub impl_name: String,
    /// Layout major version.
    pub major: u32,
    /// Layout minor version.
    pub minor: u32,
    /// IDL encoding recorded at creation.
    pub idl: IdlKind,
}

impl DbVersion {
    /// The version this engine writes for a fresh instance.
    #[must_use]
    pub fn current(idl: IdlKind) -> Self {
        Self {
            impl_name: IMPL_NAME.to_string(),
            major: CURRENT_MAJOR,
            minor: CURRENT_MINOR,
            idl,
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let line = text.lines().next().unwrap_or("").trim();
        let mut parts = line.split('/');
        let (Some(impl_name), Some(version), Some(idl)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Config(format!("malformed DBVERSION line: {line}")));
        };
        let mut nums = version.split('.');
        let (Some(major), Some(minor)) = (nums.next(), nums.next()) else {
            return Err(Error::Config(format!("malformed DBVERSION version: {version}")));
        };
        let idl = match idl {
            "old" => IdlKind::Old,
            "new" => IdlKind::New,
            other => {
                return Err(Error::Config(format!("unknown IDL scheme in DBVERSION: {other}")))
            }
        };
        Ok(Self {
            impl_name: impl_name.to_string(),
            major: major
                .parse()
                .map_err(|_| Error::Config(format!("bad DBVERSION major: {major}")))?,
            minor: minor
                .parse()
                .map_err(|_| Error::Config(format!("bad DBVERSION minor: {minor}")))?,
            idl,
        })
    }

    fn render(&self) -> String {
        format!(
            "{}/{}.{}/{}\n",
            self.impl_name, self.major, self.minor, self.idl
        )
    }

    /// Reads the instance's version file, if present.
    ///
    /// # Errors
    ///
    /// I/O and parse failures propagate.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(DBVERSION_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map(Some)
    }

    /// Writes the version file.
    ///
    /// # Errors
    ///
    /// I/O failures propagate.
    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(DBVERSION_FILE), self.render())?;
        Ok(())
    }

    /// Validates the instance directory against this engine, upgrading
    /// when the layout is exactly one major behind: version-3 index
    /// snapshots (`*.db3`) are renamed to the current suffix and the file
    /// is rewritten.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for foreign implementations, unsupported
    /// versions, or an IDL-scheme change (which requires a reindex, not an
    /// open).
    pub fn check_or_init(dir: &Path, idl: IdlKind) -> Result<()> {
        let Some(found) = Self::read(dir)? else {
            Self::current(idl).write(dir)?;
            return Ok(());
        };
        if found.impl_name != IMPL_NAME {
            return Err(Error::Config(format!(
                "instance belongs to implementation '{}'",
                found.impl_name
            )));
        }
        if found.idl != idl {
            return Err(Error::Config(format!(
                "IDL scheme is {} on disk but {} configured; reindex required",
                found.idl, idl
            )));
        }
        match found.major {
            CURRENT_MAJOR => Ok(()),
            3 => {
                upgrade_3_to_4(dir)?;
                Self::current(idl).write(dir)?;
                Ok(())
            }
            other => Err(Error::Config(format!(
                "unsupported on-disk layout version {other}"
            ))),
        }
    }
}

/// The 3→4 rename pass: `<name>.db3` becomes `<name>.db`.
fn upgrade_3_to_4(dir: &Path) -> Result<()> {
    let mut renamed = 0usize;
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "db3") {
            let target = path.with_extension("db");
            std::fs::rename(&path, &target)?;
            renamed += 1;
        }
    }
    info!(renamed, "upgraded instance layout 3 -> 4");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_directory_gets_current_version() {
        let dir = TempDir::new().unwrap();
        DbVersion::check_or_init(dir.path(), IdlKind::New).unwrap();
        let found = DbVersion::read(dir.path()).unwrap().unwrap();
        assert_eq!(found, DbVersion::current(IdlKind::New));
    }

    #[test]
    fn idl_scheme_change_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        DbVersion::check_or_init(dir.path(), IdlKind::New).unwrap();
        assert!(DbVersion::check_or_init(dir.path(), IdlKind::Old).is_err());
    }

    #[test]
    fn version_three_triggers_rename_pass() {
        let dir = TempDir::new().unwrap();
        DbVersion {
            impl_name: IMPL_NAME.into(),
            major: 3,
            minor: 7,
            idl: IdlKind::Old,
        }
        .write(dir.path())
        .unwrap();
        std::fs::write(dir.path().join("cn.db3"), b"snapshot").unwrap();

        DbVersion::check_or_init(dir.path(), IdlKind::Old).unwrap();
        assert!(dir.path().join("cn.db").exists());
        assert!(!dir.path().join("cn.db3").exists());
        let found = DbVersion::read(dir.path()).unwrap().unwrap();
        assert_eq!(found.major, CURRENT_MAJOR);
    }

    #[test]
    fn foreign_implementation_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DBVERSION_FILE), "otherdb/4.0/new\n").unwrap();
        assert!(DbVersion::check_or_init(dir.path(), IdlKind::New).is_err());
    }
}
