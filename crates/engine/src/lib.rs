//! # Sentinel Engine
//!
//! Wires the lock service, the trade-monitor job and the trading cycle
//! together and drives them from the `Scheduler`.

pub mod clock;
pub mod cycle;
pub mod error;
pub mod halt;
pub mod lock;
pub mod scheduler;
pub mod trade_monitor;

// --- Public API ---
pub use clock::{Clock, ManualClock, SystemClock};
pub use cycle::{CycleSettings, LiveTradingCycle, TradingCycle, settle};
pub use error::{EngineError, LockError};
pub use halt::{HaltReason, TradingHalt};
pub use lock::{LeaseDeadline, LockService};
pub use scheduler::{Job, Scheduler};
pub use trade_monitor::{MonitorSettings, TickOutcome, TradeMonitor};

use api_client::ErrorKind;
use configuration::RetryConfig;
use retry::RetryPolicy;

/// The retry policy for exchange calls: permanent kinds stop immediately,
/// and benign ones are not broadcast as aborts.
pub fn retry_policy(config: &RetryConfig) -> RetryPolicy<ErrorKind> {
    RetryPolicy::new(config.max_attempts, config.delay())
        .stop_on(ErrorKind::STOP)
        .benign(ErrorKind::BENIGN)
}
