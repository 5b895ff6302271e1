//! Storage adapter for lease-based locks.
//!
//! The adapter only knows how to perform the single conditional write that
//! claims a lock, read a record back, and shorten a lease the caller still
//! holds. Deciding whether a caller won is the lock service's job.

use crate::error::DbError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// The stored state of one named lock.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct LockRecord {
    pub name: String,
    pub lease_until: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stores may truncate timestamps (PostgreSQL keeps microseconds), so a
/// lease read back is matched against the written one within this window.
fn lease_tolerance() -> Duration {
    Duration::milliseconds(1)
}

impl LockRecord {
    /// A lock is available once its lease is not in the future.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.lease_until <= now
    }

    /// Whether the stored lease is the one a holder wrote as `lease_until`.
    pub fn is_lease(&self, lease_until: DateTime<Utc>) -> bool {
        (self.lease_until - lease_until).abs() <= lease_tolerance()
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically writes `lease_until` for `name` if no record exists or the
    /// stored lease is `<= now`, in one round trip.
    ///
    /// Returns the record as it stands after the write, or `None` when the
    /// condition did not hold and nothing was written.
    async fn try_claim(
        &self,
        name: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, DbError>;

    async fn get(&self, name: &str) -> Result<Option<LockRecord>, DbError>;

    /// Shortens the lease to `now` if the stored lease is still `held` and runs
    /// past `now`. Never lengthens a lease, and leaves a lease written by a
    /// later holder alone.
    ///
    /// Returns `false` when nothing matched: an unknown name, or a lease that
    /// was taken over after `held` ran out.
    async fn expire(
        &self,
        name: &str,
        held: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError>;
}

/// `LockStore` on the shared PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn try_claim(
        &self,
        name: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, DbError> {
        // Upsert guarded by the lease condition. A conflicting row whose lease
        // is still running makes the DO UPDATE a no-op and RETURNING empty.
        let record = sqlx::query_as::<_, LockRecord>(
            r#"
            INSERT INTO locks (name, lease_until, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
                SET lease_until = EXCLUDED.lease_until,
                    updated_at  = EXCLUDED.updated_at
                WHERE locks.lease_until <= $3
            RETURNING name, lease_until, updated_at
            "#,
        )
        .bind(name)
        .bind(lease_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get(&self, name: &str) -> Result<Option<LockRecord>, DbError> {
        let record = sqlx::query_as::<_, LockRecord>(
            "SELECT name, lease_until, updated_at FROM locks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn expire(
        &self,
        name: &str,
        held: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        // Only the lease the caller wrote may be shortened; a row that another
        // instance re-claimed after `held` ran out does not match.
        let result = sqlx::query(
            r#"
            UPDATE locks
            SET lease_until = LEAST(lease_until, $3), updated_at = $3
            WHERE name = $1
              AND lease_until BETWEEN $2 - interval '1 millisecond' AND $2 + interval '1 millisecond'
            "#,
        )
        .bind(name)
        .bind(held)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Process-local `LockStore`. The mutex makes check-and-set atomic, which
/// gives the same guarantees as the database within a single process.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    records: Mutex<HashMap<String, LockRecord>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_claim(
        &self,
        name: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, DbError> {
        let mut records = self.records.lock().await;
        let claimable = records.get(name).is_none_or(|r| r.is_available(now));
        if !claimable {
            return Ok(None);
        }
        let record = LockRecord {
            name: name.to_string(),
            lease_until,
            updated_at: now,
        };
        records.insert(name.to_string(), record.clone());
        Ok(Some(record))
    }

    async fn get(&self, name: &str) -> Result<Option<LockRecord>, DbError> {
        Ok(self.records.lock().await.get(name).cloned())
    }

    async fn expire(
        &self,
        name: &str,
        held: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut records = self.records.lock().await;
        match records.get_mut(name) {
            Some(record) if record.is_lease(held) => {
                record.lease_until = record.lease_until.min(now);
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
