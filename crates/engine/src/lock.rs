//! Lease-based distributed lock on top of a `LockStore`.
//!
//! Holding a lock is evidenced only by the stored lease being in the future and
//! equal to what the holder wrote. There is no owner identity: a holder that
//! crashes simply lets its lease run out, and a holder releases by naming the
//! lease it wrote.

use crate::clock::Clock;
use crate::error::LockError;
use chrono::{DateTime, Duration, Utc};
use database::LockStore;
use retry::EndPredicate;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
}

impl LockService {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Tries to take `name` until `lease_until`.
    ///
    /// Returns `Ok(true)` only when the store now holds our lease. `Ok(false)`
    /// is ordinary contention. A storage failure is `Indeterminate` and must be
    /// handled as "not acquired".
    pub async fn acquire(&self, name: &str, lease_until: DateTime<Utc>) -> Result<bool, LockError> {
        let now = self.clock.now();
        if lease_until <= now {
            debug!(lock = name, %lease_until, "Requested lease is already over, not acquiring.");
            return Ok(false);
        }

        let stored = self
            .store
            .try_claim(name, lease_until, now)
            .await
            .map_err(|source| LockError::Indeterminate {
                name: name.to_string(),
                source,
            })?;

        let acquired = stored.is_some_and(|record| record.is_lease(lease_until));
        if acquired {
            debug!(lock = name, %lease_until, "Lock acquired.");
        } else {
            debug!(lock = name, "Lock is held elsewhere.");
        }
        Ok(acquired)
    }

    /// Ends the lease we wrote as `lease_until` on `name` now.
    ///
    /// A lease that ran out and was claimed by another instance is left alone.
    /// Unknown names and storage failures are not errors: an unreleased lease
    /// expires on its own.
    pub async fn release(&self, name: &str, lease_until: DateTime<Utc>) {
        let now = self.clock.now();
        match self.store.expire(name, lease_until, now).await {
            Ok(true) => debug!(lock = name, "Lock released."),
            Ok(false) => debug!(lock = name, %lease_until, "Lease no longer ours, nothing to release."),
            Err(e) => warn!(lock = name, error = %e, "Failed to release lock; it will expire with its lease."),
        }
    }

    /// Ends whatever lease is currently stored on `name`, regardless of who
    /// wrote it. For operators clearing a lock by hand.
    pub async fn force_release(&self, name: &str) -> Result<bool, LockError> {
        let indeterminate = |source| LockError::Indeterminate {
            name: name.to_string(),
            source,
        };
        let Some(record) = self.store.get(name).await.map_err(indeterminate)? else {
            return Ok(false);
        };
        let released = self
            .store
            .expire(name, record.lease_until, self.clock.now())
            .await
            .map_err(indeterminate)?;
        if released {
            info!(lock = name, lease_until = %record.lease_until, "Lease ended by hand.");
        }
        Ok(released)
    }
}

/// The end of the lease the running tick holds, shared with the work done
/// under it.
///
/// Work checks [`LeaseDeadline::has_passed`] before starting another step. The
/// `margin` is the longest a single step may take, so no step that starts
/// before the deadline can still be running once the lease is over.
#[derive(Debug, Clone)]
pub struct LeaseDeadline {
    until: Arc<Mutex<Option<DateTime<Utc>>>>,
    margin: Duration,
}

impl LeaseDeadline {
    pub fn new(margin: Duration) -> Self {
        Self {
            until: Arc::new(Mutex::new(None)),
            margin,
        }
    }

    pub fn set(&self, lease_until: DateTime<Utc>) {
        *self.until.lock().unwrap_or_else(|p| p.into_inner()) = Some(lease_until);
    }

    pub fn clear(&self) {
        *self.until.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        *self.until.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// `true` once a step started at `now` could outlive the lease. Without a
    /// lease there is nothing to protect, so this is `false`.
    pub fn has_passed(&self, now: DateTime<Utc>) -> bool {
        self.get().is_some_and(|until| now + self.margin >= until)
    }

    /// Ends a retry run once the deadline has passed on `clock`.
    pub fn end_predicate(&self, clock: Arc<dyn Clock>) -> EndPredicate {
        let deadline = self.clone();
        Arc::new(move || deadline.has_passed(clock.now()))
    }
}

impl Default for LeaseDeadline {
    fn default() -> Self {
        Self::new(Duration::zero())
    }
}
