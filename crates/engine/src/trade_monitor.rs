//! The periodic trade-monitor job.
//!
//! One tick: take the lock, run the trading cycle, release the lock. Replicas
//! share the lock record, so per tick at most one of them runs the cycle. The
//! cycle sees the lease through a [`LeaseDeadline`] and stops starting new
//! work before the lease runs out.

use crate::cycle::TradingCycle;
use crate::error::EngineError;
use crate::lock::{LeaseDeadline, LockService};
use crate::scheduler::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use events::{EventBus, TradeEvent};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub lock_name: String,
    pub period: Duration,
    pub lease: chrono::Duration,
    pub max_open_positions: usize,
}

impl MonitorSettings {
    pub fn from_config(config: &configuration::Config) -> Result<Self, EngineError> {
        let lease = chrono::Duration::from_std(config.scheduler.lease())
            .map_err(|e| EngineError::Configuration(format!("lease_secs out of range: {e}")))?;
        Ok(Self {
            lock_name: config.scheduler.lock_name.clone(),
            period: config.scheduler.period(),
            lease,
            max_open_positions: config.trading.max_open_positions,
        })
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another instance holds the lock.
    Skipped,
    /// The lock store failed; the tick did nothing.
    Indeterminate,
    Completed {
        /// `None` when monitoring failed.
        open_positions: Option<usize>,
        started_trading: bool,
    },
}

pub struct TradeMonitor {
    locks: LockService,
    cycle: Arc<dyn TradingCycle>,
    events: EventBus,
    settings: MonitorSettings,
    deadline: LeaseDeadline,
}

impl TradeMonitor {
    pub fn new(
        locks: LockService,
        cycle: Arc<dyn TradingCycle>,
        events: EventBus,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            locks,
            cycle,
            events,
            settings,
            deadline: LeaseDeadline::default(),
        }
    }

    /// Publishes each tick's lease end to `deadline`, which the cycle shares.
    pub fn with_deadline(mut self, deadline: LeaseDeadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    #[instrument(skip(self), fields(lock = %self.settings.lock_name))]
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let name = &self.settings.lock_name;
        let lease_until = now + self.settings.lease;

        match self.locks.acquire(name, lease_until).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Trade monitor lock is held by another instance, skipping tick.");
                self.events.publish(TradeEvent::TickSkipped {
                    lock_name: name.clone(),
                    at: now,
                });
                return TickOutcome::Skipped;
            }
            Err(e) => {
                warn!(error = %e, "Could not determine lock state, skipping tick.");
                return TickOutcome::Indeterminate;
            }
        }

        // The lock is released on every path out of the cycle, panics included.
        self.deadline.set(lease_until);
        let outcome = match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("Trading cycle panicked.");
                TickOutcome::Completed {
                    open_positions: None,
                    started_trading: false,
                }
            }
        };
        self.deadline.clear();
        self.locks.release(name, lease_until).await;
        outcome
    }

    async fn run_cycle(&self) -> TickOutcome {
        let open_positions = match self.cycle.monitor_and_close_positions().await {
            Ok(open) => Some(open),
            Err(e) => {
                error!(error = %e, "Monitoring open positions failed.");
                None
            }
        };

        let has_room = open_positions.is_some_and(|open| open < self.settings.max_open_positions);
        if has_room {
            if let Err(e) = self.cycle.start_trading().await {
                error!(error = %e, "Starting new trades failed.");
            }
        } else if let Some(open) = open_positions {
            info!(open, max = self.settings.max_open_positions, "At position capacity, not trading.");
        }

        TickOutcome::Completed {
            open_positions,
            started_trading: has_room,
        }
    }
}

#[async_trait]
impl Job for TradeMonitor {
    fn name(&self) -> &str {
        &self.settings.lock_name
    }

    fn period(&self) -> Duration {
        self.settings.period
    }

    async fn run(&self, now: DateTime<Utc>) {
        let outcome = self.run_tick(now).await;
        debug!(?outcome, "Trade monitor tick finished.");
    }
}
