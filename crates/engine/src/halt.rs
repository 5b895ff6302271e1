use api_client::ErrorKind;
use chrono::{DateTime, Utc};
use events::{EventBus, TradeEvent};
use retry::AbortedError;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{error, info};

/// Why trading was halted.
#[derive(Debug, Clone, PartialEq)]
pub struct HaltReason {
    pub operation: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Blocks new trades after a permanent exchange failure.
///
/// Fed by the retry executor's abort channel. Monitoring of open positions is
/// not affected; only `start_trading` consults the halt. It stays engaged until
/// `rearm` is called, i.e. until an operator restarts the process.
pub struct TradingHalt {
    reason: Mutex<Option<HaltReason>>,
    aborts: Mutex<broadcast::Receiver<AbortedError<ErrorKind>>>,
    events: EventBus,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl TradingHalt {
    pub fn new(aborts: broadcast::Receiver<AbortedError<ErrorKind>>, events: EventBus) -> Self {
        Self {
            reason: Mutex::new(None),
            aborts: Mutex::new(aborts),
            events,
        }
    }

    /// Drains pending aborts, then reports whether new trades are blocked.
    pub fn is_engaged(&self) -> bool {
        self.absorb_aborts();
        guard(&self.reason).is_some()
    }

    pub fn reason(&self) -> Option<HaltReason> {
        self.absorb_aborts();
        guard(&self.reason).clone()
    }

    /// Engages the halt. The first reason is kept until re-armed.
    pub fn engage(&self, operation: &str, reason: &str, at: DateTime<Utc>) {
        let mut current = guard(&self.reason);
        if current.is_some() {
            return;
        }
        error!(operation, reason, "Trading halted after a permanent exchange failure.");
        *current = Some(HaltReason {
            operation: operation.to_string(),
            reason: reason.to_string(),
            at,
        });
        self.events.publish(TradeEvent::TradingHalted {
            operation: operation.to_string(),
            reason: reason.to_string(),
            at,
        });
    }

    pub fn rearm(&self) {
        self.absorb_aborts();
        if guard(&self.reason).take().is_some() {
            info!("Trading re-armed.");
        }
    }

    fn absorb_aborts(&self) {
        let mut aborts = guard(&self.aborts);
        loop {
            match aborts.try_recv() {
                Ok(aborted) => {
                    let reason = format!("{}: {}", aborted.kind, aborted.message);
                    self.engage(&aborted.operation, &reason, aborted.at);
                }
                Err(TryRecvError::Lagged(missed)) => {
                    self.engage("abort channel", &format!("{missed} aborts missed"), Utc::now());
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aborted(kind: ErrorKind) -> AbortedError<ErrorKind> {
        AbortedError {
            operation: "open_position BTCUSDT".to_string(),
            kind,
            message: "Margin is insufficient.".to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_abort_engages_halt_and_publishes() {
        let (tx, rx) = broadcast::channel(8);
        let bus = EventBus::new();
        let mut sub = bus.subscribe("test", 4).unwrap();
        let halt = TradingHalt::new(rx, bus);

        assert!(!halt.is_engaged());
        tx.send(aborted(ErrorKind::InsufficientBalance)).unwrap();
        assert!(halt.is_engaged());
        assert_eq!(halt.reason().unwrap().operation, "open_position BTCUSDT");
        assert_eq!(sub.try_recv().unwrap().name(), "TradingHalted");
    }

    #[test]
    fn test_first_reason_wins_until_rearmed() {
        let (tx, rx) = broadcast::channel(8);
        let halt = TradingHalt::new(rx, EventBus::new());
        tx.send(aborted(ErrorKind::InsufficientBalance)).unwrap();
        tx.send(aborted(ErrorKind::Rejected)).unwrap();

        assert!(halt.reason().unwrap().reason.starts_with("insufficient_balance"));
        halt.rearm();
        assert!(!halt.is_engaged());
    }
}
