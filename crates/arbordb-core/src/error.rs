//! Error types for `ArborDB`.
//!
//! One unified error enum for the whole engine. Each variant carries a
//! stable diagnostic code (`ARBOR-NNN`) so callers and log scrapers can key
//! on something sturdier than message text.
//!
//! Variants fall into four families, mirroring how callers react:
//!
//! - **Transient**: deadlock, busy, abandoned, limits. Retried or surfaced
//!   as a temporary condition.
//! - **Client-visible logical**: no-such-object, already-exists, syntax
//!   violations. These abort the transaction and report.
//! - **Resource**: disk-full, run-recovery. These latch the instance fatal flag.
//! - **Internal**: invariant violations, serialization failures.

use thiserror::Error;

/// Result type alias for `ArborDB` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the storage engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Store reported a deadlock; the whole operation should be retried (ARBOR-001).
    #[error("[ARBOR-001] deadlock detected, operation must be retried")]
    Deadlock,

    /// Deadlock retries exhausted (ARBOR-002).
    #[error("[ARBOR-002] backend busy: retries exhausted")]
    Busy,

    /// The client abandoned the operation mid-flight (ARBOR-003).
    #[error("[ARBOR-003] operation abandoned")]
    Abandoned,

    /// The operation ran past its stop time (ARBOR-004).
    #[error("[ARBOR-004] time limit exceeded")]
    TimeLimitExceeded,

    /// A scan examined more candidates than `lookthroughlimit` allows (ARBOR-005).
    #[error("[ARBOR-005] administrative limit exceeded")]
    AdminLimitExceeded,

    /// No entry exists at the named DN (ARBOR-010).
    #[error("[ARBOR-010] no such object: {0}")]
    NoSuchObject(String),

    /// An entry already exists at the target DN (ARBOR-011).
    #[error("[ARBOR-011] entry already exists: {0}")]
    AlreadyExists(String),

    /// Delete or rename attempted on an entry with subordinates (ARBOR-012).
    #[error("[ARBOR-012] operation not allowed on non-leaf entry: {0}")]
    NotAllowedOnNonleaf(String),

    /// A DN failed to parse (ARBOR-013).
    #[error("[ARBOR-013] invalid DN syntax: {0}")]
    InvalidDnSyntax(String),

    /// Post-image failed object class checks (ARBOR-014).
    #[error("[ARBOR-014] object class violation: {0}")]
    ObjectClassViolation(String),

    /// An attribute value failed its syntax check (ARBOR-015).
    #[error("[ARBOR-015] invalid attribute syntax: {0}")]
    InvalidSyntax(String),

    /// The engine refuses the request as formulated (ARBOR-016).
    #[error("[ARBOR-016] unwilling to perform: {0}")]
    UnwillingToPerform(String),

    /// Malformed control or request payload (ARBOR-017).
    #[error("[ARBOR-017] protocol error: {0}")]
    ProtocolError(String),

    /// A modify referenced an attribute or value the entry does not have (ARBOR-018).
    #[error("[ARBOR-018] no such attribute: {0}")]
    NoSuchAttribute(String),

    /// A modify added a value the entry already has (ARBOR-019).
    #[error("[ARBOR-019] attribute or value exists: {0}")]
    TypeOrValueExists(String),

    /// The 32-bit ID space is exhausted (ARBOR-020).
    ///
    /// No further adds are possible until the database is rebuilt.
    #[error("[ARBOR-020] ID space exhausted, database must be rebuilt")]
    MaxIdReached,

    /// The store reported a full disk (ARBOR-021).
    ///
    /// Distinct from plain I/O failure because the commit path runs a
    /// dedicated cleanup and the instance refuses further writes.
    #[error("[ARBOR-021] disk full")]
    DiskFull,

    /// The store's write-ahead state requires recovery (ARBOR-022).
    ///
    /// Fatal: the process must stop and run recovery before reopening.
    #[error("[ARBOR-022] store requires recovery")]
    RunRecovery,

    /// IO error (ARBOR-023).
    #[error("[ARBOR-023] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry or IDL (de)serialization failed (ARBOR-024).
    #[error("[ARBOR-024] serialization error: {0}")]
    Serialization(String),

    /// Configuration rejected (ARBOR-025).
    #[error("[ARBOR-025] configuration error: {0}")]
    Config(String),

    /// Attribute encryption provider failed (ARBOR-026).
    #[error("[ARBOR-026] attribute encryption error: {0}")]
    Crypt(String),

    /// A plugin vetoed the operation (ARBOR-027).
    #[error("[ARBOR-027] plugin rejected operation at {hook}: {message}")]
    PluginVeto {
        /// Hook point that produced the veto.
        hook: &'static str,
        /// Plugin-supplied message.
        message: String,
    },

    /// Internal invariant violation (ARBOR-030).
    #[error("[ARBOR-030] operations error: {0}")]
    Operations(String),
}

impl Error {
    /// Returns the stable diagnostic code (e.g. "ARBOR-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Deadlock => "ARBOR-001",
            Self::Busy => "ARBOR-002",
            Self::Abandoned => "ARBOR-003",
            Self::TimeLimitExceeded => "ARBOR-004",
            Self::AdminLimitExceeded => "ARBOR-005",
            Self::NoSuchObject(_) => "ARBOR-010",
            Self::AlreadyExists(_) => "ARBOR-011",
            Self::NotAllowedOnNonleaf(_) => "ARBOR-012",
            Self::InvalidDnSyntax(_) => "ARBOR-013",
            Self::ObjectClassViolation(_) => "ARBOR-014",
            Self::InvalidSyntax(_) => "ARBOR-015",
            Self::UnwillingToPerform(_) => "ARBOR-016",
            Self::ProtocolError(_) => "ARBOR-017",
            Self::NoSuchAttribute(_) => "ARBOR-018",
            Self::TypeOrValueExists(_) => "ARBOR-019",
            Self::MaxIdReached => "ARBOR-020",
            Self::DiskFull => "ARBOR-021",
            Self::RunRecovery => "ARBOR-022",
            Self::Io(_) => "ARBOR-023",
            Self::Serialization(_) => "ARBOR-024",
            Self::Config(_) => "ARBOR-025",
            Self::Crypt(_) => "ARBOR-026",
            Self::PluginVeto { .. } => "ARBOR-027",
            Self::Operations(_) => "ARBOR-030",
        }
    }

    /// True when retrying (or waiting) may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Deadlock
                | Self::Busy
                | Self::Abandoned
                | Self::TimeLimitExceeded
                | Self::AdminLimitExceeded
        )
    }

    /// True when the instance must refuse further writes.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::RunRecovery | Self::DiskFull)
    }
}

impl From<crate::store::StoreError> for Error {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match err {
            StoreError::NotFound => Self::NoSuchObject(err.to_string()),
            StoreError::Deadlock => Self::Deadlock,
            StoreError::RunRecovery => Self::RunRecovery,
            StoreError::DiskFull => Self::DiskFull,
            StoreError::Permission(msg) => Self::UnwillingToPerform(msg),
            StoreError::Io(err) => Self::Io(err),
            StoreError::Corrupt(msg) => Self::Serialization(msg),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Deadlock.code(), "ARBOR-001");
        assert_eq!(Error::MaxIdReached.code(), "ARBOR-020");
        assert_eq!(Error::Operations("x".into()).code(), "ARBOR-030");
    }

    #[test]
    fn transience_classification() {
        assert!(Error::Deadlock.is_transient());
        assert!(Error::Busy.is_transient());
        assert!(!Error::DiskFull.is_transient());
        assert!(Error::DiskFull.is_fatal());
        assert!(Error::RunRecovery.is_fatal());
        assert!(!Error::NoSuchObject("cn=a".into()).is_fatal());
    }
}
