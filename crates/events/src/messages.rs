use crate::error::EventsError;
use chrono::{DateTime, Utc};
use core_types::{ExitReason, PositionDirection, PositionStatus, TradePosition};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The position fields every lifecycle event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSummary {
    pub id: Uuid,
    pub symbol: String,
    pub direction: PositionDirection,
    pub status: PositionStatus,
    pub size: Decimal,
    pub amount_in: Decimal,
    pub entry_price: Decimal,
}

impl From<&TradePosition> for PositionSummary {
    fn from(p: &TradePosition) -> Self {
        Self {
            id: p.id,
            symbol: p.symbol(),
            direction: p.position_direction,
            status: p.status,
            size: p.size,
            amount_in: p.amount_in,
            entry_price: p.entry_price,
        }
    }
}

/// Something that happened to a position or to the trading loop.
///
/// Serialized as `{"type": "...", "payload": {...}}`, for example:
/// `{"type": "PositionClosed", "payload": {"position": {...}, "reason": "TAKE_PROFIT", ...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TradeEvent {
    PositionPlanned {
        position: PositionSummary,
    },
    PositionOpened {
        position: PositionSummary,
        fill_price: Decimal,
    },
    PositionClosed {
        position: PositionSummary,
        reason: ExitReason,
        exit_price: Decimal,
        amount_out: Decimal,
        realized_pnl: Decimal,
    },
    /// A close was attempted and failed permanently; the position stays open.
    CloseFailed {
        position: PositionSummary,
        error: String,
    },
    /// An open was attempted and failed permanently; the plan stays unfilled.
    OpenFailed {
        position: PositionSummary,
        error: String,
    },
    /// New trades are blocked until an operator re-arms trading.
    TradingHalted {
        operation: String,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Another instance held the lock for this tick.
    TickSkipped {
        lock_name: String,
        at: DateTime<Utc>,
    },
}

impl TradeEvent {
    /// Short name of the variant, used as a log field.
    pub fn name(&self) -> &'static str {
        match self {
            TradeEvent::PositionPlanned { .. } => "PositionPlanned",
            TradeEvent::PositionOpened { .. } => "PositionOpened",
            TradeEvent::PositionClosed { .. } => "PositionClosed",
            TradeEvent::CloseFailed { .. } => "CloseFailed",
            TradeEvent::OpenFailed { .. } => "OpenFailed",
            TradeEvent::TradingHalted { .. } => "TradingHalted",
            TradeEvent::TickSkipped { .. } => "TickSkipped",
        }
    }

    pub fn to_json(&self) -> Result<String, EventsError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serialization() {
        let event = TradeEvent::TickSkipped {
            lock_name: "trade-monitor".to_string(),
            at: Utc::now(),
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "TickSkipped");
        assert_eq!(json["payload"]["lock_name"], "trade-monitor");
    }
}
