//! Persistence of trade positions and enforcement of their lifecycle.
//!
//! Every write is a targeted field-level update: a price refresh, an exit-flag
//! toggle and a close can interleave freely, each touching only its own
//! columns. Transition rules are checked inside the same statement that
//! writes, never in a separate read.

use crate::error::DbError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    ClosePosition, NewTradePosition, PositionStatus, TradePosition, TradePositionUpdate,
    UpdateRejection,
};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Result of an `update` or `close`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The write was applied; carries the record after the write.
    Updated(TradePosition),
    /// Nothing to do, e.g. closing an already closed position.
    Unchanged(TradePosition),
    /// The write would break a lifecycle rule; the record is untouched.
    Rejected {
        current: TradePosition,
        reason: UpdateRejection,
    },
    NotFound,
}

impl UpdateOutcome {
    /// The record as it stands after the call, if it exists.
    pub fn position(&self) -> Option<&TradePosition> {
        match self {
            UpdateOutcome::Updated(p) | UpdateOutcome::Unchanged(p) => Some(p),
            UpdateOutcome::Rejected { current, .. } => Some(current),
            UpdateOutcome::NotFound => None,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Inserts a new position in the caller-specified initial status.
    async fn create(&self, position: NewTradePosition) -> Result<TradePosition, DbError>;

    async fn get(&self, id: Uuid) -> Result<Option<TradePosition>, DbError>;

    /// Applies the present fields of `update`, rejecting backward transitions
    /// and settlement-field violations.
    async fn update(&self, id: Uuid, update: &TradePositionUpdate) -> Result<UpdateOutcome, DbError>;

    /// Settles an open position. Closing a position that is already terminal
    /// returns `Unchanged`, so duplicate fill notifications are harmless.
    async fn close(&self, id: Uuid, close: &ClosePosition) -> Result<UpdateOutcome, DbError>;

    /// All positions with status `OPEN`.
    async fn list_open(&self) -> Result<Vec<TradePosition>, DbError>;

    /// Most recently created positions, newest first.
    async fn list_recent(&self, limit: i64) -> Result<Vec<TradePosition>, DbError>;
}

fn ensure_terminal(close: &ClosePosition) -> Result<(), DbError> {
    if close.status.is_terminal() {
        Ok(())
    } else {
        Err(DbError::InvalidInput(core_types::CoreError::InvalidInput(
            "status".to_string(),
            format!("{} is not a closing status", close.status),
        )))
    }
}

/// Derives the outcome of a write that matched no row from the current record.
fn explain_miss(current: Option<TradePosition>, update: &TradePositionUpdate) -> UpdateOutcome {
    match current {
        None => UpdateOutcome::NotFound,
        Some(current) => match update.check_against(&current) {
            Err(reason) => UpdateOutcome::Rejected { current, reason },
            Ok(()) => UpdateOutcome::Unchanged(current),
        },
    }
}

// ==============================================================================
// PostgreSQL
// ==============================================================================

const POSITION_COLUMNS: &str = "id, platform, status, token, currency, size, amount_in, amount_out, \
     position_direction, leverage, entry_price, current_price, take_profit_price, stop_loss_price, \
     realized_pnl, exit_flag, last_error, time_opened, time_closed, time_last_price_update, created_at";

/// `PositionStore` on the shared PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PgPositionStore {
    pool: PgPool,
}

impl PgPositionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn position_from_row(row: &PgRow) -> Result<TradePosition, DbError> {
    let status: String = row.try_get("status")?;
    let direction: String = row.try_get("position_direction")?;
    let leverage: i32 = row.try_get("leverage")?;
    Ok(TradePosition {
        id: row.try_get("id")?,
        platform: row.try_get("platform")?,
        status: status.parse().map_err(|e: core_types::CoreError| DbError::InvalidRow(e.to_string()))?,
        token: row.try_get("token")?,
        currency: row.try_get("currency")?,
        size: row.try_get("size")?,
        amount_in: row.try_get("amount_in")?,
        amount_out: row.try_get("amount_out")?,
        position_direction: direction
            .parse()
            .map_err(|e: core_types::CoreError| DbError::InvalidRow(e.to_string()))?,
        leverage: u32::try_from(leverage)
            .map_err(|_| DbError::InvalidRow(format!("negative leverage {leverage}")))?,
        entry_price: row.try_get("entry_price")?,
        current_price: row.try_get("current_price")?,
        take_profit_price: row.try_get("take_profit_price")?,
        stop_loss_price: row.try_get("stop_loss_price")?,
        realized_pnl: row.try_get("realized_pnl")?,
        exit_flag: row.try_get("exit_flag")?,
        last_error: row.try_get("last_error")?,
        time_opened: row.try_get("time_opened")?,
        time_closed: row.try_get("time_closed")?,
        time_last_price_update: row.try_get("time_last_price_update")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn create(&self, position: NewTradePosition) -> Result<TradePosition, DbError> {
        let position = position.into_position(Uuid::new_v4(), Utc::now())?;
        let leverage = i32::try_from(position.leverage).map_err(|_| {
            core_types::CoreError::InvalidInput("leverage".to_string(), position.leverage.to_string())
        })?;

        let query = format!(
            r#"
            INSERT INTO trade_positions (
                id, platform, status, token, currency, size, amount_in, position_direction,
                leverage, entry_price, take_profit_price, stop_loss_price, exit_flag,
                time_opened, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {POSITION_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(position.id)
            .bind(&position.platform)
            .bind(position.status.as_str())
            .bind(&position.token)
            .bind(&position.currency)
            .bind(position.size)
            .bind(position.amount_in)
            .bind(position.position_direction.as_str())
            .bind(leverage)
            .bind(position.entry_price)
            .bind(position.take_profit_price)
            .bind(position.stop_loss_price)
            .bind(position.exit_flag)
            .bind(position.time_opened)
            .bind(position.created_at)
            .fetch_one(&self.pool)
            .await?;

        position_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<TradePosition>, DbError> {
        let query = format!("SELECT {POSITION_COLUMNS} FROM trade_positions WHERE id = $1");
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(position_from_row).transpose()
    }

    async fn update(&self, id: Uuid, update: &TradePositionUpdate) -> Result<UpdateOutcome, DbError> {
        // The WHERE clause mirrors `TradePositionUpdate::check_against`, so the
        // rule check and the write happen atomically in one statement.
        let query = format!(
            r#"
            UPDATE trade_positions SET
                status                 = COALESCE($2, status),
                amount_out             = COALESCE($3, amount_out),
                entry_price            = COALESCE($4, entry_price),
                current_price          = COALESCE($5, current_price),
                take_profit_price      = COALESCE($6, take_profit_price),
                stop_loss_price        = COALESCE($7, stop_loss_price),
                realized_pnl           = COALESCE($8, realized_pnl),
                exit_flag              = COALESCE($9, exit_flag),
                last_error             = COALESCE($10, last_error),
                time_opened            = COALESCE($11, time_opened),
                time_closed            = COALESCE($12, time_closed),
                time_last_price_update = COALESCE($13, time_last_price_update)
            WHERE id = $1
              AND ($2::text IS NULL OR $2 = status
                   OR (status = 'PLAN' AND $2 = 'OPEN')
                   OR (status = 'OPEN' AND $2 IN ('CLOSED', 'FAILED')))
              AND (status NOT IN ('CLOSED', 'FAILED')
                   OR ($3::numeric IS NULL AND $8::numeric IS NULL AND $12::timestamptz IS NULL))
              AND (COALESCE($2, status) <> 'PLAN' OR COALESCE($3, amount_out) IS NULL)
              AND (COALESCE($12, time_closed) IS NULL
                   OR (COALESCE($3, amount_out) IS NOT NULL
                       AND COALESCE($2, status) IN ('CLOSED', 'FAILED')))
              AND (COALESCE($2, status) NOT IN ('CLOSED', 'FAILED')
                   OR (COALESCE($3, amount_out) IS NOT NULL
                       AND COALESCE($12, time_closed) IS NOT NULL))
            RETURNING {POSITION_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(update.status.map(|s| s.as_str()))
            .bind(update.amount_out)
            .bind(update.entry_price)
            .bind(update.current_price)
            .bind(update.take_profit_price)
            .bind(update.stop_loss_price)
            .bind(update.realized_pnl)
            .bind(update.exit_flag)
            .bind(update.last_error.as_deref())
            .bind(update.time_opened)
            .bind(update.time_closed)
            .bind(update.time_last_price_update)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(UpdateOutcome::Updated(position_from_row(&row)?)),
            None => Ok(explain_miss(self.get(id).await?, update)),
        }
    }

    async fn close(&self, id: Uuid, close: &ClosePosition) -> Result<UpdateOutcome, DbError> {
        ensure_terminal(close)?;
        let query = format!(
            r#"
            UPDATE trade_positions SET
                status                 = $2,
                amount_out             = $3,
                current_price          = $4,
                realized_pnl           = $5,
                time_closed            = $6,
                time_last_price_update = $6,
                exit_flag              = FALSE
            WHERE id = $1 AND status = 'OPEN'
            RETURNING {POSITION_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(close.status.as_str())
            .bind(close.amount_out)
            .bind(close.exit_price)
            .bind(close.realized_pnl)
            .bind(close.time_closed)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(UpdateOutcome::Updated(position_from_row(&row)?)),
            None => Ok(close_miss(self.get(id).await?, close)),
        }
    }

    async fn list_open(&self) -> Result<Vec<TradePosition>, DbError> {
        let query = format!(
            "SELECT {POSITION_COLUMNS} FROM trade_positions WHERE status = 'OPEN' ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<TradePosition>, DbError> {
        let query = format!(
            "SELECT {POSITION_COLUMNS} FROM trade_positions ORDER BY created_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&query).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(position_from_row).collect()
    }
}

/// A close that matched no OPEN row: terminal records make it a no-op.
fn close_miss(current: Option<TradePosition>, close: &ClosePosition) -> UpdateOutcome {
    match current {
        None => UpdateOutcome::NotFound,
        Some(current) if current.status.is_terminal() => UpdateOutcome::Unchanged(current),
        Some(current) => UpdateOutcome::Rejected {
            reason: UpdateRejection::IllegalTransition {
                from: current.status,
                to: close.status,
            },
            current,
        },
    }
}

// ==============================================================================
// In-memory
// ==============================================================================

/// Process-local `PositionStore` with the same lifecycle rules as the
/// database. Used by tests and single-instance dry runs.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: Mutex<HashMap<Uuid, TradePosition>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut positions: Vec<TradePosition>) -> Vec<TradePosition> {
        positions.sort_by_key(|p| p.created_at);
        positions
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn create(&self, position: NewTradePosition) -> Result<TradePosition, DbError> {
        let position = position.into_position(Uuid::new_v4(), Utc::now())?;
        self.positions.lock().await.insert(position.id, position.clone());
        Ok(position)
    }

    async fn get(&self, id: Uuid) -> Result<Option<TradePosition>, DbError> {
        Ok(self.positions.lock().await.get(&id).cloned())
    }

    async fn update(&self, id: Uuid, update: &TradePositionUpdate) -> Result<UpdateOutcome, DbError> {
        let mut positions = self.positions.lock().await;
        let Some(current) = positions.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if let Err(reason) = update.check_against(current) {
            return Ok(UpdateOutcome::Rejected { current: current.clone(), reason });
        }
        if update.is_noop_for(current) {
            return Ok(UpdateOutcome::Unchanged(current.clone()));
        }
        update.apply_to(current);
        Ok(UpdateOutcome::Updated(current.clone()))
    }

    async fn close(&self, id: Uuid, close: &ClosePosition) -> Result<UpdateOutcome, DbError> {
        ensure_terminal(close)?;
        let mut positions = self.positions.lock().await;
        let Some(current) = positions.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if current.status != PositionStatus::Open {
            return Ok(close_miss(Some(current.clone()), close));
        }
        let update = TradePositionUpdate::from(close.clone());
        if let Err(reason) = update.check_against(current) {
            return Ok(UpdateOutcome::Rejected { current: current.clone(), reason });
        }
        update.apply_to(current);
        Ok(UpdateOutcome::Updated(current.clone()))
    }

    async fn list_open(&self) -> Result<Vec<TradePosition>, DbError> {
        let positions = self.positions.lock().await;
        Ok(Self::sorted(
            positions
                .values()
                .filter(|p| p.status == PositionStatus::Open)
                .cloned()
                .collect(),
        ))
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<TradePosition>, DbError> {
        let positions = self.positions.lock().await;
        let mut all = Self::sorted(positions.values().cloned().collect());
        all.reverse();
        all.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(all)
    }
}

/// Convenience for callers that only need the exit flag toggled.
pub async fn set_exit_flag(
    store: &dyn PositionStore,
    id: Uuid,
    flag: bool,
) -> Result<UpdateOutcome, DbError> {
    store.update(id, &TradePositionUpdate::exit_flag(flag)).await
}

/// Records a permanent exchange failure for audit. Status is untouched.
pub async fn record_error(
    store: &dyn PositionStore,
    id: Uuid,
    message: impl Into<String>,
) -> Result<UpdateOutcome, DbError> {
    store.update(id, &TradePositionUpdate::error(message)).await
}

/// Convenience for the price feed: refreshes `current_price` only.
pub async fn record_price(
    store: &dyn PositionStore,
    id: Uuid,
    price: Decimal,
    at: DateTime<Utc>,
) -> Result<UpdateOutcome, DbError> {
    store.update(id, &TradePositionUpdate::price(price, at)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::PositionDirection;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn new_plan() -> NewTradePosition {
        NewTradePosition {
            platform: "binance-futures".to_string(),
            status: PositionStatus::Plan,
            token: "PEPE".to_string(),
            currency: "USDT".to_string(),
            size: dec!(200_000_000),
            amount_in: dec!(1_000_000),
            position_direction: PositionDirection::Long,
            leverage: 1,
            entry_price: dec!(0.005),
            take_profit_price: None,
            stop_loss_price: None,
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle_leaves_open_list() {
        let store = MemoryPositionStore::new();
        let pos = store.create(new_plan()).await.unwrap();
        assert_eq!(pos.status, PositionStatus::Plan);
        assert_eq!(pos.amount_in, dec!(1_000_000));

        let open = TradePositionUpdate {
            status: Some(PositionStatus::Open),
            amount_out: Some(dec!(900_000)),
            ..Default::default()
        };
        assert!(store.update(pos.id, &open).await.unwrap().is_updated());
        assert_eq!(store.list_open().await.unwrap().len(), 1);

        let closed = TradePositionUpdate {
            status: Some(PositionStatus::Closed),
            realized_pnl: Some(dec!(-100_000)),
            time_closed: Some(Utc::now()),
            ..Default::default()
        };
        let outcome = store.update(pos.id, &closed).await.unwrap();
        let after = outcome.position().unwrap();
        assert_eq!(after.status, PositionStatus::Closed);
        assert_eq!(after.amount_out, Some(dec!(900_000)));
        assert!(store.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_always_has_amount_out() {
        let store = MemoryPositionStore::new();
        let pos = store.create(new_plan()).await.unwrap();
        store
            .update(pos.id, &TradePositionUpdate::opened(dec!(0.005), Utc::now()))
            .await
            .unwrap();

        let bad_close = TradePositionUpdate {
            status: Some(PositionStatus::Closed),
            time_closed: Some(Utc::now()),
            ..Default::default()
        };
        let outcome = store.update(pos.id, &bad_close).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Rejected { .. }));

        for p in store.list_recent(10).await.unwrap() {
            if p.status == PositionStatus::Closed {
                assert!(p.amount_out.is_some());
            }
        }
        assert_eq!(store.get(pos.id).await.unwrap().unwrap().status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_backward_update_is_a_noop() {
        let store = MemoryPositionStore::new();
        let pos = store.create(new_plan()).await.unwrap();
        store
            .update(pos.id, &TradePositionUpdate::opened(dec!(0.005), Utc::now()))
            .await
            .unwrap();
        let back = TradePositionUpdate { status: Some(PositionStatus::Plan), ..Default::default() };
        let outcome = store.update(pos.id, &back).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Rejected { .. }));
        assert_eq!(store.get(pos.id).await.unwrap().unwrap().status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = MemoryPositionStore::new();
        let pos = store.create(new_plan()).await.unwrap();
        store
            .update(pos.id, &TradePositionUpdate::opened(dec!(0.005), Utc::now()))
            .await
            .unwrap();

        let close = ClosePosition {
            status: PositionStatus::Closed,
            exit_price: dec!(0.006),
            amount_out: dec!(1_200_000),
            realized_pnl: dec!(200_000),
            time_closed: Utc::now(),
        };
        assert!(store.close(pos.id, &close).await.unwrap().is_updated());

        let mut duplicate = close.clone();
        duplicate.amount_out = dec!(1);
        let again = store.close(pos.id, &duplicate).await.unwrap();
        assert!(matches!(again, UpdateOutcome::Unchanged(_)));
        assert_eq!(again.position().unwrap().amount_out, Some(dec!(1_200_000)));
    }

    #[tokio::test]
    async fn test_close_of_plan_is_rejected_and_unknown_id_not_found() {
        let store = MemoryPositionStore::new();
        let pos = store.create(new_plan()).await.unwrap();
        let close = ClosePosition {
            status: PositionStatus::Closed,
            exit_price: dec!(0.006),
            amount_out: dec!(1),
            realized_pnl: dec!(0),
            time_closed: Utc::now(),
        };
        assert!(matches!(
            store.close(pos.id, &close).await.unwrap(),
            UpdateOutcome::Rejected { .. }
        ));
        assert_eq!(
            store.close(Uuid::new_v4(), &close).await.unwrap(),
            UpdateOutcome::NotFound
        );
        let not_terminal = ClosePosition { status: PositionStatus::Open, ..close };
        assert!(store.close(pos.id, &not_terminal).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_field_writers_do_not_clobber() {
        let store = Arc::new(MemoryPositionStore::new());
        let pos = store.create(new_plan()).await.unwrap();
        store
            .update(pos.id, &TradePositionUpdate::opened(dec!(0.005), Utc::now()))
            .await
            .unwrap();

        let price_store = Arc::clone(&store);
        let flag_store = Arc::clone(&store);
        let (a, b) = tokio::join!(
            async move { record_price(price_store.as_ref(), pos.id, dec!(0.0055), Utc::now()).await },
            async move { set_exit_flag(flag_store.as_ref(), pos.id, true).await },
        );
        a.unwrap();
        b.unwrap();

        let after = store.get(pos.id).await.unwrap().unwrap();
        assert_eq!(after.current_price, Some(dec!(0.0055)));
        assert!(after.exit_flag);
        assert_eq!(after.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_repeated_identical_update_is_unchanged() {
        let store = MemoryPositionStore::new();
        let pos = store.create(new_plan()).await.unwrap();
        assert!(set_exit_flag(&store, pos.id, true).await.unwrap().is_updated());
        assert!(matches!(
            set_exit_flag(&store, pos.id, true).await.unwrap(),
            UpdateOutcome::Unchanged(_)
        ));
    }

    /// Runs against a real database: `DATABASE_URL=... cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn test_postgres_guards_match_memory_rules() {
        let config = configuration::DatabaseConfig::default();
        let pool = crate::connect(&config).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        let store = PgPositionStore::new(pool);

        let pos = store.create(new_plan()).await.unwrap();
        let early = TradePositionUpdate { amount_out: Some(dec!(1)), ..Default::default() };
        assert_eq!(
            store.update(pos.id, &early).await.unwrap(),
            UpdateOutcome::Rejected {
                current: store.get(pos.id).await.unwrap().unwrap(),
                reason: UpdateRejection::AmountOutWhilePlanned,
            }
        );

        store
            .update(pos.id, &TradePositionUpdate::opened(dec!(0.005), Utc::now()))
            .await
            .unwrap();
        let close = ClosePosition {
            status: PositionStatus::Closed,
            exit_price: dec!(0.0045),
            amount_out: dec!(900_000),
            realized_pnl: dec!(-100_000),
            time_closed: Utc::now(),
        };
        assert!(store.close(pos.id, &close).await.unwrap().is_updated());
        assert!(matches!(
            store.close(pos.id, &close).await.unwrap(),
            UpdateOutcome::Unchanged(_)
        ));
        assert!(store.list_open().await.unwrap().iter().all(|p| p.id != pos.id));
    }
}
