//! The work done while holding the trade-monitor lock.

use crate::clock::Clock;
use crate::error::EngineError;
use crate::halt::TradingHalt;
use crate::lock::LeaseDeadline;
use api_client::{CloseOrder, ErrorKind, Exchange, Fill, OpenOrder, SignalSource};
use async_trait::async_trait;
use core_types::precision::{margin_for, realized_pnl, round_cents};
use core_types::{
    ClosePosition, CoreError, ExitReason, NewTradePosition, PositionStatus, TradePosition,
    TradePositionUpdate, TradeSignal,
};
use database::{PositionStore, UpdateOutcome};
use events::{EventBus, PositionSummary, TradeEvent};
use retry::{Retry, RetryFailure};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// The two operations a trade-monitor tick performs under the lock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradingCycle: Send + Sync {
    /// Refreshes, evaluates and closes open positions. Returns how many are
    /// still open afterwards.
    async fn monitor_and_close_positions(&self) -> Result<usize, EngineError>;

    /// Opens new positions from the signal source.
    async fn start_trading(&self) -> Result<(), EngineError>;
}

/// Static settings of the default cycle.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub platform: String,
    pub currency: String,
    pub max_open_positions: usize,
    pub default_leverage: u32,
}

impl From<&configuration::TradingConfig> for CycleSettings {
    fn from(c: &configuration::TradingConfig) -> Self {
        Self {
            platform: c.platform.clone(),
            currency: c.currency.clone(),
            max_open_positions: c.max_open_positions,
            default_leverage: c.default_leverage,
        }
    }
}

/// Default `TradingCycle` against an `Exchange` and a `PositionStore`.
pub struct LiveTradingCycle {
    positions: Arc<dyn PositionStore>,
    exchange: Arc<dyn Exchange>,
    signals: Arc<dyn SignalSource>,
    retry: Retry<ErrorKind>,
    halt: Arc<TradingHalt>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    settings: CycleSettings,
    deadline: LeaseDeadline,
}

impl LiveTradingCycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        positions: Arc<dyn PositionStore>,
        exchange: Arc<dyn Exchange>,
        signals: Arc<dyn SignalSource>,
        retry: Retry<ErrorKind>,
        halt: Arc<TradingHalt>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            positions,
            exchange,
            signals,
            retry,
            halt,
            events,
            clock,
            settings,
            deadline: LeaseDeadline::default(),
        }
    }

    /// Stops retries and further positions once `deadline` has passed. Share
    /// it with the `TradeMonitor` that holds the lease.
    pub fn with_deadline(mut self, deadline: LeaseDeadline) -> Self {
        self.retry = self.retry.with_end_predicate(deadline.end_predicate(self.clock.clone()));
        self.deadline = deadline;
        self
    }

    fn lease_running_out(&self) -> bool {
        self.deadline.has_passed(self.clock.now())
    }

    /// Returns `true` when the position is no longer open.
    #[instrument(skip_all, fields(id = %position.id, symbol = %position.symbol()))]
    async fn monitor_position(&self, position: &TradePosition) -> Result<bool, EngineError> {
        let symbol = position.symbol();
        let exchange = &self.exchange;

        let position = match self
            .retry
            .run(&format!("mark_price {symbol}"), |_| exchange.mark_price(&symbol))
            .await
        {
            Ok(price) => {
                let update = TradePositionUpdate::price(price, self.clock.now());
                match self.positions.update(position.id, &update).await? {
                    UpdateOutcome::Updated(p) | UpdateOutcome::Unchanged(p) => p,
                    UpdateOutcome::Rejected { current, .. } => current,
                    UpdateOutcome::NotFound => return Ok(true),
                }
            }
            Err(failure) => {
                // Evaluate on the stored price; the exit flag still applies.
                warn!(error = %failure, "Mark price unavailable.");
                position.clone()
            }
        };
        if position.status != PositionStatus::Open {
            return Ok(true);
        }

        let Some(reason) = position.exit_reason() else {
            debug!(price = ?position.current_price, "No exit condition met.");
            return Ok(false);
        };
        info!(%reason, price = ?position.current_price, "Exit condition met, closing.");
        self.close(&position, reason).await
    }

    async fn close(&self, position: &TradePosition, reason: ExitReason) -> Result<bool, EngineError> {
        let order = CloseOrder {
            client_order_id: Uuid::new_v4(),
            symbol: position.symbol(),
            direction: position.position_direction,
            size: position.size,
        };
        let exchange = &self.exchange;
        let label = format!("close_position {}", order.symbol);

        let fill = match self.retry.run(&label, |_| exchange.close_position(&order)).await {
            Ok(fill) => fill,
            Err(failure) => {
                self.record_failure(position, &failure).await?;
                self.events.publish(TradeEvent::CloseFailed {
                    position: position.into(),
                    error: failure.to_string(),
                });
                return Ok(false);
            }
        };

        let settlement = settle(position, &fill, self.clock.now())?;
        match self.positions.close(position.id, &settlement).await? {
            UpdateOutcome::Updated(closed) => {
                info!(
                    status = %closed.status,
                    exit_price = %settlement.exit_price,
                    amount_out = %settlement.amount_out,
                    realized_pnl = %settlement.realized_pnl,
                    "Position closed."
                );
                self.events.publish(TradeEvent::PositionClosed {
                    position: PositionSummary::from(&closed),
                    reason,
                    exit_price: settlement.exit_price,
                    amount_out: settlement.amount_out,
                    realized_pnl: settlement.realized_pnl,
                });
                Ok(true)
            }
            UpdateOutcome::Unchanged(_) | UpdateOutcome::NotFound => Ok(true),
            UpdateOutcome::Rejected { reason, .. } => Err(EngineError::Rejected(position.id, reason)),
        }
    }

    async fn record_failure(
        &self,
        position: &TradePosition,
        failure: &RetryFailure<api_client::ApiError>,
    ) -> Result<(), EngineError> {
        error!(id = %position.id, error = %failure, "Exchange call failed permanently.");
        database::record_error(self.positions.as_ref(), position.id, failure.to_string()).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(token = %signal.token, direction = %signal.direction))]
    async fn open_from_signal(&self, signal: TradeSignal) -> Result<(), EngineError> {
        let leverage = signal
            .leverage
            .filter(|l| *l > 0)
            .unwrap_or(self.settings.default_leverage);
        let size = signal.size.abs();
        if size.is_zero() {
            warn!("Ignoring signal with zero size.");
            return Ok(());
        }
        let amount_in = margin_for(size, signal.reference_price, leverage)?;

        let plan = self
            .positions
            .create(NewTradePosition {
                platform: self.settings.platform.clone(),
                status: PositionStatus::Plan,
                token: signal.token,
                currency: if signal.currency.is_empty() {
                    self.settings.currency.clone()
                } else {
                    signal.currency
                },
                size,
                amount_in,
                position_direction: signal.direction,
                leverage,
                entry_price: signal.reference_price,
                take_profit_price: signal.take_profit_price,
                stop_loss_price: signal.stop_loss_price,
            })
            .await?;
        self.events.publish(TradeEvent::PositionPlanned { position: (&plan).into() });

        // The plan id doubles as the client order id, so a retried open is
        // deduplicated by the gateway.
        let order = OpenOrder {
            client_order_id: plan.id,
            symbol: plan.symbol(),
            direction: plan.position_direction,
            size,
            leverage,
            margin: amount_in,
        };
        let exchange = &self.exchange;
        let label = format!("open_position {}", order.symbol);

        let fill = match self.retry.run(&label, |_| exchange.open_position(&order)).await {
            Ok(fill) => fill,
            Err(failure) => {
                self.record_failure(&plan, &failure).await?;
                self.events.publish(TradeEvent::OpenFailed {
                    position: (&plan).into(),
                    error: failure.to_string(),
                });
                return Ok(());
            }
        };

        let opened = TradePositionUpdate::opened(fill.price, self.clock.now());
        match self.positions.update(plan.id, &opened).await? {
            UpdateOutcome::Updated(open) => {
                info!(id = %open.id, price = %fill.price, amount_in = %open.amount_in, "Position opened.");
                self.events.publish(TradeEvent::PositionOpened {
                    position: PositionSummary::from(&open),
                    fill_price: fill.price,
                });
                Ok(())
            }
            UpdateOutcome::Rejected { reason, .. } => Err(EngineError::Rejected(plan.id, reason)),
            UpdateOutcome::Unchanged(_) | UpdateOutcome::NotFound => Ok(()),
        }
    }
}

/// Settlement of `position` from a closing fill, with every amount in cents.
///
/// A liquidated position settles as `Failed` with its margin lost.
pub fn settle(
    position: &TradePosition,
    fill: &Fill,
    at: chrono::DateTime<chrono::Utc>,
) -> Result<ClosePosition, CoreError> {
    if fill.liquidated {
        return Ok(ClosePosition {
            status: PositionStatus::Failed,
            exit_price: fill.price,
            amount_out: Decimal::ZERO,
            realized_pnl: -round_cents(position.amount_in),
            time_closed: at,
        });
    }
    let pnl = realized_pnl(position.position_direction, position.size, position.entry_price, fill.price)?
        - round_cents(fill.fee);
    let amount_out = round_cents(position.amount_in + pnl).max(Decimal::ZERO);
    Ok(ClosePosition {
        status: PositionStatus::Closed,
        exit_price: fill.price,
        amount_out,
        realized_pnl: pnl,
        time_closed: at,
    })
}

#[async_trait]
impl TradingCycle for LiveTradingCycle {
    async fn monitor_and_close_positions(&self) -> Result<usize, EngineError> {
        let open = self.positions.list_open().await?;
        let mut still_open = 0;
        for (checked, position) in open.iter().enumerate() {
            if self.lease_running_out() {
                let remaining = open.len() - checked;
                warn!(remaining, "Lease is running out, leaving the rest for the next tick.");
                still_open += remaining;
                break;
            }
            match self.monitor_position(position).await {
                Ok(true) => {}
                Ok(false) => still_open += 1,
                Err(e) => {
                    error!(id = %position.id, error = %e, "Failed to monitor position.");
                    still_open += 1;
                }
            }
        }
        debug!(listed = open.len(), still_open, "Monitoring pass complete.");
        Ok(still_open)
    }

    async fn start_trading(&self) -> Result<(), EngineError> {
        if self.lease_running_out() {
            info!("Lease is running out, not trading this tick.");
            return Ok(());
        }
        if let Some(halt) = self.halt.reason() {
            info!(operation = %halt.operation, reason = %halt.reason, "Trading is halted, not opening positions.");
            return Ok(());
        }

        let open_count = self.positions.list_open().await?.len();
        let room = self.settings.max_open_positions.saturating_sub(open_count);
        if room == 0 {
            return Ok(());
        }

        let source = &self.signals;
        let signals = self.retry.run("signals", |_| source.signals(open_count)).await?;
        if signals.is_empty() {
            debug!("No trade signals.");
            return Ok(());
        }

        for signal in signals.into_iter().take(room) {
            if self.halt.is_engaged() {
                break;
            }
            if self.lease_running_out() {
                warn!("Lease is running out, not opening more positions.");
                break;
            }
            if let Err(e) = self.open_from_signal(signal).await {
                error!(error = %e, "Failed to act on trade signal.");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use api_client::{ApiError, PaperCall, PaperExchange};
    use chrono::Utc;
    use core_types::PositionDirection;
    use database::MemoryPositionStore;
    use mockall::mock;
    use retry::RetryPolicy;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::broadcast;

    mock! {
        pub Signals {}
        #[async_trait]
        impl SignalSource for Signals {
            async fn signals(&self, open_count: usize) -> Result<Vec<TradeSignal>, ApiError>;
        }
    }

    struct Harness {
        cycle: LiveTradingCycle,
        store: Arc<MemoryPositionStore>,
        exchange: Arc<PaperExchange>,
        halt: Arc<TradingHalt>,
        clock: Arc<ManualClock>,
    }

    fn harness(signals: MockSignals) -> Harness {
        let store = Arc::new(MemoryPositionStore::new());
        let exchange = Arc::new(PaperExchange::new(Decimal::ZERO));
        let (aborts, aborts_rx) = broadcast::channel(16);
        let events = EventBus::new();
        let halt = Arc::new(TradingHalt::new(aborts_rx, events.clone()));
        let retry = Retry::new(
            RetryPolicy::new(3, Duration::from_millis(10))
                .stop_on(ErrorKind::STOP)
                .benign(ErrorKind::BENIGN),
        )
        .with_abort_channel(aborts);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cycle = LiveTradingCycle::new(
            store.clone(),
            exchange.clone(),
            Arc::new(signals),
            retry,
            halt.clone(),
            events,
            clock.clone(),
            CycleSettings {
                platform: "binance-futures".to_string(),
                currency: "USDT".to_string(),
                max_open_positions: 2,
                default_leverage: 5,
            },
        );
        Harness { cycle, store, exchange, halt, clock }
    }

    async fn open_position(store: &MemoryPositionStore, tp: Option<Decimal>) -> TradePosition {
        let plan = store
            .create(NewTradePosition {
                platform: "binance-futures".to_string(),
                status: PositionStatus::Plan,
                token: "BTC".to_string(),
                currency: "USDT".to_string(),
                size: dec!(0.01),
                amount_in: dec!(100),
                position_direction: PositionDirection::Long,
                leverage: 5,
                entry_price: dec!(50000),
                take_profit_price: tp,
                stop_loss_price: Some(dec!(49000)),
            })
            .await
            .unwrap();
        store
            .update(plan.id, &TradePositionUpdate::opened(dec!(50000), Utc::now()))
            .await
            .unwrap()
            .position()
            .cloned()
            .unwrap()
    }

    fn signal() -> TradeSignal {
        TradeSignal {
            token: "BTC".to_string(),
            currency: "USDT".to_string(),
            direction: PositionDirection::Long,
            size: dec!(0.01),
            reference_price: dec!(50000),
            leverage: None,
            take_profit_price: None,
            stop_loss_price: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_profit_closes_with_cent_amounts() {
        let h = harness(MockSignals::new());
        let pos = open_position(&h.store, Some(dec!(52000))).await;
        h.exchange.set_price("BTCUSDT", dec!(52000.123)).await;

        let still_open = h.cycle.monitor_and_close_positions().await.unwrap();
        assert_eq!(still_open, 0);

        let closed = h.store.get(pos.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        // 0.01 * 52000.123 = 520.00123 -> 520.00; 520.00 - 500.00
        assert_eq!(closed.realized_pnl, Some(dec!(20.00)));
        assert_eq!(closed.amount_out, Some(dec!(120.00)));
        assert!(closed.time_closed.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_flag_closes_without_price() {
        let h = harness(MockSignals::new());
        let pos = open_position(&h.store, None).await;
        database::set_exit_flag(h.store.as_ref(), pos.id, true).await.unwrap();
        h.exchange.set_price("BTCUSDT", dec!(50000)).await;
        // Price feed is down for every attempt; the close still goes through.
        for _ in 0..3 {
            h.exchange.fail_next(PaperCall::MarkPrice, ErrorKind::Timeout).await;
        }

        assert_eq!(h.cycle.monitor_and_close_positions().await.unwrap(), 0);
        let closed = h.store.get(pos.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(!closed.exit_flag);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_close_failure_keeps_position_open_and_halts() {
        let h = harness(MockSignals::new());
        let pos = open_position(&h.store, None).await;
        database::set_exit_flag(h.store.as_ref(), pos.id, true).await.unwrap();
        h.exchange.set_price("BTCUSDT", dec!(50000)).await;
        h.exchange.fail_next(PaperCall::MarkPrice, ErrorKind::Timeout).await;
        h.exchange.fail_next(PaperCall::Close, ErrorKind::Rejected).await;

        assert_eq!(h.cycle.monitor_and_close_positions().await.unwrap(), 1);
        let after = h.store.get(pos.id).await.unwrap().unwrap();
        assert_eq!(after.status, PositionStatus::Open);
        assert!(after.amount_out.is_none());
        assert!(after.last_error.unwrap().contains("rejected"));
        assert!(h.halt.is_engaged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liquidation_settles_as_failed() {
        let h = harness(MockSignals::new());
        let pos = open_position(&h.store, None).await;
        h.exchange.set_price("BTCUSDT", dec!(40000)).await;
        h.exchange.liquidate("BTCUSDT").await;

        assert_eq!(h.cycle.monitor_and_close_positions().await.unwrap(), 0);
        let failed = h.store.get(pos.id).await.unwrap().unwrap();
        assert_eq!(failed.status, PositionStatus::Failed);
        assert_eq!(failed.amount_out, Some(Decimal::ZERO));
        assert_eq!(failed.realized_pnl, Some(dec!(-100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_trading_opens_up_to_capacity() {
        let mut signals = MockSignals::new();
        signals
            .expect_signals()
            .times(1)
            .returning(|_| Ok(vec![signal(), signal(), signal()]));
        let h = harness(signals);
        h.exchange.set_price("BTCUSDT", dec!(50010)).await;

        h.cycle.start_trading().await.unwrap();

        let open = h.store.list_open().await.unwrap();
        assert_eq!(open.len(), 2);
        for p in open {
            assert_eq!(p.entry_price, dec!(50010));
            // 0.01 * 50000 / 5
            assert_eq!(p.amount_in, dec!(100.00));
            assert_eq!(p.leverage, 5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_leaves_plan_with_error() {
        let mut signals = MockSignals::new();
        signals.expect_signals().returning(|_| Ok(vec![signal()]));
        let h = harness(signals);
        h.exchange.set_price("BTCUSDT", dec!(50000)).await;
        h.exchange.fail_next(PaperCall::Open, ErrorKind::InsufficientBalance).await;

        h.cycle.start_trading().await.unwrap();

        let recent = h.store.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, PositionStatus::Plan);
        assert!(recent[0].last_error.is_some());
        assert!(h.halt.is_engaged());

        // Halted: the next call does not even ask for signals.
        h.cycle.start_trading().await.unwrap();
        assert_eq!(h.store.list_recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_halted_cycle_never_asks_for_signals() {
        let mut signals = MockSignals::new();
        signals.expect_signals().times(0);
        let h = harness(signals);
        h.halt.engage("operator", "manual", Utc::now());
        h.cycle.start_trading().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiring_lease_stops_new_work() {
        let mut signals = MockSignals::new();
        signals.expect_signals().times(0);
        let Harness { cycle, store, exchange, clock, .. } = harness(signals);
        let deadline = LeaseDeadline::new(chrono::Duration::seconds(6));
        let cycle = cycle.with_deadline(deadline.clone());
        let pos = open_position(&store, None).await;
        database::set_exit_flag(store.as_ref(), pos.id, true).await.unwrap();
        exchange.set_price("BTCUSDT", dec!(50000)).await;

        deadline.set(clock.now() + chrono::Duration::seconds(5));
        assert_eq!(cycle.monitor_and_close_positions().await.unwrap(), 1);
        assert_eq!(store.get(pos.id).await.unwrap().unwrap().status, PositionStatus::Open);
        cycle.start_trading().await.unwrap();

        // With the lease cleared the flagged position is closed.
        deadline.clear();
        assert_eq!(cycle.monitor_and_close_positions().await.unwrap(), 0);
    }
}
