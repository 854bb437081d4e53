//! Instance configuration.
//!
//! Layered the usual way: built-in defaults, then `arbordb.toml`, then
//! `ARBORDB_*` environment variables. The option names follow the knobs a
//! directory backend exposes; anything unset falls back to a default that
//! keeps a small instance healthy.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::idl::IdlKind;

/// Default AllIds threshold substituted for a configured zero.
pub const DEFAULT_ALLIDSTHRESHOLD: usize = 4000;

/// Index kinds enabled for one attribute, as configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Attribute base type.
    pub attr: String,
    /// Enabled kinds: any of `pres`, `eq`, `approx`, `sub`.
    pub kinds: Vec<String>,
    /// Matching-rule OIDs indexed for this attribute.
    pub matching_rules: Vec<String>,
    /// Name of the attribute-encryption cipher, when the attribute is
    /// encrypted (`aes-256-gcm` is the built-in provider).
    pub attrcrypt: Option<String>,
}

/// One backend instance's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Suffix DN this instance serves.
    pub suffix: String,
    /// Max entries examined per query before ADMIN_LIMIT; 0 = unlimited.
    pub lookthroughlimit: usize,
    /// Max IDL length built by a range read before returning AllIds;
    /// 0 = unlimited.
    pub idlistscanlimit: usize,
    /// IDL size above which a key promotes to AllIds.
    pub allidsthreshold: usize,
    /// Store page size; sizes the old encoding's blocks.
    pub pagesize: usize,
    /// Store cache budget in bytes (advisory for the substrate).
    pub dbcachesize: usize,
    /// Entry cache budget in bytes.
    pub cachememsize: usize,
    /// Entry cache budget in entries.
    pub cachesize: usize,
    /// DN cache budget in bytes.
    pub dncachememsize: usize,
    /// Serialize all writers at the backend level.
    pub serial_lock: bool,
    /// Keep the DN tree table so subtree renames touch only the apex.
    pub subtree_rename: bool,
    /// Which on-disk IDL encoding to use.
    pub idl_switch: IdlKind,
    /// Per-attribute index table.
    pub index: Vec<IndexConfig>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            suffix: String::new(),
            lookthroughlimit: 5000,
            idlistscanlimit: 0,
            allidsthreshold: DEFAULT_ALLIDSTHRESHOLD,
            pagesize: 8192,
            dbcachesize: 10 * 1024 * 1024,
            cachememsize: 10 * 1024 * 1024,
            cachesize: 4096,
            dncachememsize: 10 * 1024 * 1024,
            serial_lock: false,
            subtree_rename: true,
            idl_switch: IdlKind::default(),
            index: Vec::new(),
        }
    }
}

impl InstanceConfig {
    /// Loads the layered configuration, optionally from a TOML file.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] on parse failure or invalid values.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("ARBORDB_"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validated()
    }

    /// Applies the substitution rules a running server uses: a zero
    /// AllIds threshold silently becomes the default.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for values no substitution can repair.
    pub fn validated(mut self) -> Result<Self> {
        if self.allidsthreshold == 0 {
            self.allidsthreshold = DEFAULT_ALLIDSTHRESHOLD;
        }
        if self.pagesize < 512 {
            return Err(Error::Config(format!(
                "pagesize {} below the 512-byte minimum",
                self.pagesize
            )));
        }
        for index in &self.index {
            if index.attr.is_empty() {
                return Err(Error::Config("index entry with empty attribute".into()));
            }
            for kind in &index.kinds {
                if !matches!(kind.as_str(), "pres" | "eq" | "approx" | "sub") {
                    return Err(Error::Config(format!(
                        "unknown index kind '{kind}' for attribute {}",
                        index.attr
                    )));
                }
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = InstanceConfig::default().validated().unwrap();
        assert_eq!(config.allidsthreshold, DEFAULT_ALLIDSTHRESHOLD);
        assert!(config.subtree_rename);
        assert_eq!(config.idl_switch, IdlKind::New);
    }

    #[test]
    fn zero_threshold_is_substituted() {
        let config = InstanceConfig {
            allidsthreshold: 0,
            ..InstanceConfig::default()
        };
        assert_eq!(
            config.validated().unwrap().allidsthreshold,
            DEFAULT_ALLIDSTHRESHOLD
        );
    }

    #[test]
    fn bad_index_kind_is_rejected() {
        let config = InstanceConfig {
            index: vec![IndexConfig {
                attr: "cn".into(),
                kinds: vec!["wavelet".into()],
                ..IndexConfig::default()
            }],
            ..InstanceConfig::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn toml_file_layers_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbordb.toml");
        std::fs::write(
            &path,
            r#"
suffix = "o=example"
allidsthreshold = 1000
idl_switch = "old"

[[index]]
attr = "cn"
kinds = ["eq", "sub"]
"#,
        )
        .unwrap();
        let config = InstanceConfig::load(Some(&path)).unwrap();
        assert_eq!(config.suffix, "o=example");
        assert_eq!(config.allidsthreshold, 1000);
        assert_eq!(config.idl_switch, IdlKind::Old);
        assert_eq!(config.index.len(), 1);
        // Untouched options keep their defaults.
        assert_eq!(config.pagesize, 8192);
    }
}
