//! The transaction envelope and per-operation context.
//!
//! Every mutation runs the same loop: begin a (child) transaction, redo the
//! work from saved inputs, and commit; a deadlock anywhere restarts the
//! loop until [`RETRY_TIMES`] attempts are spent, at which point the
//! operation surfaces as busy. The loop is a small explicit state machine
//! so the abort/retry edges stay visible.
//!
//! The [`OpContext`] carries what used to live on process-global state:
//! the abandon flag, the operation stop time, the operation CSN, the
//! front-end's tombstone request, and the "don't bypass the filter test"
//! signal the IDL set engine raises.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::entry::Csn;
use crate::error::{Error, Result};
use crate::store::{Store, StoreError, Txn};

/// Deadlock retry budget per operation.
pub const RETRY_TIMES: usize = 50;

/// How often (in loop iterations) long scans sample the abandon flag and
/// stop time.
pub const CHECK_INTERVAL: usize = 10;

/// Per-operation context.
#[derive(Debug, Default)]
pub struct OpContext {
    abandoned: AtomicBool,
    stop_time: Option<Instant>,
    dont_bypass_filter_test: AtomicBool,
    csn: Option<Csn>,
    tombstone: bool,
}

impl OpContext {
    /// A context with no limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the operation to `limit` from now.
    #[must_use]
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.stop_time = Some(Instant::now() + limit);
        self
    }

    /// Attaches the replication-supplied change sequence number.
    #[must_use]
    pub fn with_csn(mut self, csn: Csn) -> Self {
        self.csn = Some(csn);
        self
    }

    /// The operation CSN, when replication supplied one.
    #[must_use]
    pub fn csn(&self) -> Option<&Csn> {
        self.csn.as_ref()
    }

    /// Requests tombstone semantics: a delete rewrites the entry as its
    /// tombstone form instead of removing the row. Supplied by the
    /// front-end independently of the CSN.
    #[must_use]
    pub fn with_tombstone(mut self) -> Self {
        self.tombstone = true;
        self
    }

    /// True when the front-end asked for tombstone semantics.
    #[must_use]
    pub fn tombstone_requested(&self) -> bool {
        self.tombstone
    }

    /// Marks the operation abandoned (the `abandon` entry point).
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    /// True once [`OpContext::abandon`] ran.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Sampled inside scan loops: every [`CHECK_INTERVAL`] iterations,
    /// fail fast when the operation was abandoned or ran out of time.
    ///
    /// # Errors
    ///
    /// [`Error::Abandoned`] or [`Error::TimeLimitExceeded`].
    pub fn check_limits(&self, iteration: usize) -> Result<()> {
        if iteration % CHECK_INTERVAL != 0 {
            return Ok(());
        }
        if self.is_abandoned() {
            return Err(Error::Abandoned);
        }
        if let Some(stop) = self.stop_time {
            if Instant::now() >= stop {
                return Err(Error::TimeLimitExceeded);
            }
        }
        Ok(())
    }

    /// Raises the "don't bypass the filter test" signal: the candidate
    /// list is a superset and every candidate must be re-checked.
    pub fn set_dont_bypass_filter_test(&self) {
        self.dont_bypass_filter_test.store(true, Ordering::Release);
    }

    /// Reads the filter-test signal.
    #[must_use]
    pub fn dont_bypass_filter_test(&self) -> bool {
        self.dont_bypass_filter_test.load(Ordering::Acquire)
    }
}

/// Runs `body` inside a (child) transaction with deadlock retry.
///
/// The loop walks the states setup → in-txn → committed, detouring
/// through retrying on deadlock until the budget is spent (exhausted →
/// busy). `body` must be restartable: it is called with a fresh
/// transaction on every attempt and has to restore its inputs from copies
/// it made before the loop. Only [`Error::Deadlock`] restarts; every
/// other error aborts and propagates.
///
/// # Errors
///
/// [`Error::Busy`] once the retry budget is spent; otherwise whatever
/// `body` or the commit surfaced.
pub fn with_retry<T>(
    store: &Store,
    parent: Option<&Txn>,
    mut body: impl FnMut(&Txn) -> Result<T>,
) -> Result<T> {
    for attempt in 0..RETRY_TIMES {
        if attempt > 0 {
            debug!(attempt, "deadlock, retrying operation");
            std::thread::sleep(Duration::from_millis(attempt.min(10) as u64));
        }
        let txn = store.begin(parent).map_err(Error::from)?;

        match body(&txn) {
            Ok(value) => match txn.commit() {
                Ok(()) => return Ok(value),
                Err(StoreError::Deadlock) => {}
                Err(err) => return Err(err.into()),
            },
            Err(Error::Deadlock) => txn.abort(),
            Err(err) => {
                txn.abort();
                return Err(err);
            }
        }
    }
    Err(Error::Busy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn retry_survives_transient_deadlocks() {
        let store = Store::in_memory();
        let db = store.open_db("cn", false).unwrap();
        let mut failures = 3;
        let out = with_retry(&store, None, |txn| {
            if failures > 0 {
                failures -= 1;
                return Err(Error::Deadlock);
            }
            txn.put(db, b"=a", b"1")?;
            Ok(42)
        })
        .unwrap();
        assert_eq!(out, 42);

        let txn = store.begin(None).unwrap();
        assert_eq!(txn.get(db, b"=a").unwrap(), b"1");
        txn.abort();
    }

    #[test]
    fn retry_budget_exhaustion_is_busy() {
        let store = Store::in_memory();
        let out: Result<()> = with_retry(&store, None, |_txn| Err(Error::Deadlock));
        assert!(matches!(out, Err(Error::Busy)));
    }

    #[test]
    fn non_transient_errors_abort_immediately() {
        let store = Store::in_memory();
        let mut calls = 0;
        let out: Result<()> = with_retry(&store, None, |_txn| {
            calls += 1;
            Err(Error::NoSuchObject("cn=missing".into()))
        });
        assert!(matches!(out, Err(Error::NoSuchObject(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn context_limits() {
        let ctx = OpContext::new().with_time_limit(Duration::from_millis(0));
        assert!(ctx.check_limits(1).is_ok()); // off the sampling interval
        assert!(matches!(
            ctx.check_limits(CHECK_INTERVAL),
            Err(Error::TimeLimitExceeded)
        ));

        let ctx = OpContext::new();
        ctx.abandon();
        assert!(matches!(ctx.check_limits(0), Err(Error::Abandoned)));
    }

    #[test]
    fn filter_test_flag_lives_on_the_context() {
        let ctx = OpContext::new();
        assert!(!ctx.dont_bypass_filter_test());
        ctx.set_dont_bypass_filter_test();
        assert!(ctx.dont_bypass_filter_test());
    }

    #[test]
    fn tombstone_request_is_independent_of_the_csn() {
        let ctx = OpContext::new().with_csn(crate::entry::Csn("5f000001".into()));
        assert!(!ctx.tombstone_requested());

        let ctx = OpContext::new().with_tombstone();
        assert!(ctx.tombstone_requested());
        assert!(ctx.csn().is_none());
    }
}
