use crate::enums::{ExitReason, PositionDirection, PositionStatus};
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One exchange exposure, from the moment it is planned until it is settled.
///
/// Records are never deleted; a finished position stays in a terminal status
/// for history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePosition {
    pub id: Uuid,
    /// Exchange identifier (e.g. "binance-futures").
    pub platform: String,
    pub status: PositionStatus,
    /// Base instrument (e.g. "BTC").
    pub token: String,
    /// Quote / settlement currency (e.g. "USDT").
    pub currency: String,
    /// Absolute base-asset quantity. Direction lives in `position_direction`.
    pub size: Decimal,
    /// Committed margin, in the settlement currency.
    pub amount_in: Decimal,
    pub amount_out: Option<Decimal>,
    pub position_direction: PositionDirection,
    pub leverage: u32,
    pub entry_price: Decimal,
    pub current_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    /// Operator or automation request to close at the next monitoring tick.
    pub exit_flag: bool,
    /// Last permanent exchange failure, kept for audit.
    pub last_error: Option<String>,
    pub time_opened: Option<DateTime<Utc>>,
    pub time_closed: Option<DateTime<Utc>>,
    pub time_last_price_update: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TradePosition {
    /// Trading pair symbol as the exchange expects it, e.g. "BTCUSDT".
    pub fn symbol(&self) -> String {
        format!("{}{}", self.token, self.currency)
    }

    /// Decides whether the position must be closed at the current price.
    ///
    /// The exit flag wins over price-based conditions. Without a current price
    /// only the exit flag can trigger.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        if self.status != PositionStatus::Open {
            return None;
        }
        if self.exit_flag {
            return Some(ExitReason::ExitFlag);
        }
        let price = self.current_price?;
        match self.position_direction {
            PositionDirection::Long => {
                if self.take_profit_price.is_some_and(|tp| price >= tp) {
                    Some(ExitReason::TakeProfit)
                } else if self.stop_loss_price.is_some_and(|sl| price <= sl) {
                    Some(ExitReason::StopLoss)
                } else {
                    None
                }
            }
            PositionDirection::Short => {
                if self.take_profit_price.is_some_and(|tp| price <= tp) {
                    Some(ExitReason::TakeProfit)
                } else if self.stop_loss_price.is_some_and(|sl| price >= sl) {
                    Some(ExitReason::StopLoss)
                } else {
                    None
                }
            }
        }
    }
}

/// Input for creating a position record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTradePosition {
    pub platform: String,
    /// Initial status, normally `Plan`.
    pub status: PositionStatus,
    pub token: String,
    pub currency: String,
    pub size: Decimal,
    pub amount_in: Decimal,
    pub position_direction: PositionDirection,
    pub leverage: u32,
    pub entry_price: Decimal,
    pub take_profit_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
}

impl NewTradePosition {
    /// Validates the input and builds the full record.
    ///
    /// A terminal initial status is rejected because it would need settlement
    /// data that only a close can provide.
    pub fn into_position(self, id: Uuid, now: DateTime<Utc>) -> Result<TradePosition, CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::InvalidInput(
                "status".to_string(),
                format!("{} cannot be an initial status", self.status),
            ));
        }
        if self.amount_in < Decimal::ZERO {
            return Err(CoreError::InvalidInput(
                "amount_in".to_string(),
                self.amount_in.to_string(),
            ));
        }
        if self.size < Decimal::ZERO {
            return Err(CoreError::InvalidInput("size".to_string(), self.size.to_string()));
        }
        let time_opened = (self.status == PositionStatus::Open).then_some(now);
        Ok(TradePosition {
            id,
            platform: self.platform,
            status: self.status,
            token: self.token,
            currency: self.currency,
            size: self.size,
            amount_in: self.amount_in,
            amount_out: None,
            position_direction: self.position_direction,
            leverage: self.leverage,
            entry_price: self.entry_price,
            current_price: None,
            take_profit_price: self.take_profit_price,
            stop_loss_price: self.stop_loss_price,
            realized_pnl: None,
            exit_flag: false,
            last_error: None,
            time_opened,
            time_closed: None,
            time_last_price_update: None,
            created_at: now,
        })
    }
}

/// A partial, field-level update. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradePositionUpdate {
    pub status: Option<PositionStatus>,
    pub amount_out: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    pub current_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub exit_flag: Option<bool>,
    pub last_error: Option<String>,
    pub time_opened: Option<DateTime<Utc>>,
    pub time_closed: Option<DateTime<Utc>>,
    pub time_last_price_update: Option<DateTime<Utc>>,
}

/// Why an update was refused. The stored record is left unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpdateRejection {
    #[error("status cannot move from {from} to {to}")]
    IllegalTransition { from: PositionStatus, to: PositionStatus },

    #[error("settlement fields of a {0} position are immutable")]
    AlreadySettled(PositionStatus),

    #[error("a planned position cannot carry amount_out")]
    AmountOutWhilePlanned,

    #[error("time_closed requires amount_out")]
    ClosedWithoutAmountOut,

    #[error("time_closed is only valid for a terminal status")]
    ClosedWhileActive,

    #[error("a {0} position requires amount_out and time_closed")]
    MissingSettlement(PositionStatus),
}

impl TradePositionUpdate {
    /// Price refresh from the external price feed.
    pub fn price(price: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            current_price: Some(price),
            time_last_price_update: Some(at),
            ..Self::default()
        }
    }

    pub fn exit_flag(flag: bool) -> Self {
        Self {
            exit_flag: Some(flag),
            ..Self::default()
        }
    }

    /// Confirmed exchange fill of a planned position.
    pub fn opened(entry_price: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(PositionStatus::Open),
            entry_price: Some(entry_price),
            current_price: Some(entry_price),
            time_opened: Some(at),
            time_last_price_update: Some(at),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(message.into()),
            ..Self::default()
        }
    }

    fn touches_settlement(&self) -> bool {
        self.amount_out.is_some() || self.time_closed.is_some() || self.realized_pnl.is_some()
    }

    /// Checks the update against the stored record without applying it.
    pub fn check_against(&self, current: &TradePosition) -> Result<(), UpdateRejection> {
        if let Some(next) = self.status {
            if !current.status.can_transition_to(next) {
                return Err(UpdateRejection::IllegalTransition { from: current.status, to: next });
            }
        }
        if current.status.is_terminal() && self.touches_settlement() {
            return Err(UpdateRejection::AlreadySettled(current.status));
        }

        let status = self.status.unwrap_or(current.status);
        let amount_out = self.amount_out.or(current.amount_out);
        let time_closed = self.time_closed.or(current.time_closed);

        if status == PositionStatus::Plan && amount_out.is_some() {
            return Err(UpdateRejection::AmountOutWhilePlanned);
        }
        if time_closed.is_some() && amount_out.is_none() {
            return Err(UpdateRejection::ClosedWithoutAmountOut);
        }
        if time_closed.is_some() && !status.is_terminal() {
            return Err(UpdateRejection::ClosedWhileActive);
        }
        if status.is_terminal() && (amount_out.is_none() || time_closed.is_none()) {
            return Err(UpdateRejection::MissingSettlement(status));
        }
        Ok(())
    }

    /// Writes every present field onto `position`. Call `check_against` first.
    pub fn apply_to(&self, position: &mut TradePosition) {
        if let Some(v) = self.status {
            position.status = v;
        }
        if let Some(v) = self.amount_out {
            position.amount_out = Some(v);
        }
        if let Some(v) = self.entry_price {
            position.entry_price = v;
        }
        if let Some(v) = self.current_price {
            position.current_price = Some(v);
        }
        if let Some(v) = self.take_profit_price {
            position.take_profit_price = Some(v);
        }
        if let Some(v) = self.stop_loss_price {
            position.stop_loss_price = Some(v);
        }
        if let Some(v) = self.realized_pnl {
            position.realized_pnl = Some(v);
        }
        if let Some(v) = self.exit_flag {
            position.exit_flag = v;
        }
        if let Some(v) = &self.last_error {
            position.last_error = Some(v.clone());
        }
        if let Some(v) = self.time_opened {
            position.time_opened = Some(v);
        }
        if let Some(v) = self.time_closed {
            position.time_closed = Some(v);
        }
        if let Some(v) = self.time_last_price_update {
            position.time_last_price_update = Some(v);
        }
    }

    /// `true` when applying the update would not change `position`.
    pub fn is_noop_for(&self, position: &TradePosition) -> bool {
        let mut copy = position.clone();
        self.apply_to(&mut copy);
        copy == *position
    }
}

/// Settlement data written by a close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosePosition {
    /// `Closed`, or `Failed` when the exchange liquidated the position.
    pub status: PositionStatus,
    pub exit_price: Decimal,
    pub amount_out: Decimal,
    pub realized_pnl: Decimal,
    pub time_closed: DateTime<Utc>,
}

impl From<ClosePosition> for TradePositionUpdate {
    fn from(close: ClosePosition) -> Self {
        Self {
            status: Some(close.status),
            amount_out: Some(close.amount_out),
            current_price: Some(close.exit_price),
            realized_pnl: Some(close.realized_pnl),
            time_closed: Some(close.time_closed),
            time_last_price_update: Some(close.time_closed),
            exit_flag: Some(false),
            ..Self::default()
        }
    }
}

/// A trade idea produced by the signal source (the predictive model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub token: String,
    /// Empty means the configured settlement currency.
    #[serde(default)]
    pub currency: String,
    pub direction: PositionDirection,
    /// Base-asset quantity to trade. The sign is ignored.
    pub size: Decimal,
    /// Price the model based its decision on.
    pub reference_price: Decimal,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub take_profit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss_price: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn planned() -> TradePosition {
        NewTradePosition {
            platform: "binance-futures".to_string(),
            status: PositionStatus::Plan,
            token: "BTC".to_string(),
            currency: "USDT".to_string(),
            size: dec!(0.01),
            amount_in: dec!(100),
            position_direction: PositionDirection::Long,
            leverage: 5,
            entry_price: dec!(50000),
            take_profit_price: Some(dec!(52000)),
            stop_loss_price: Some(dec!(49000)),
        }
        .into_position(Uuid::new_v4(), Utc::now())
        .unwrap()
    }

    fn opened() -> TradePosition {
        let mut p = planned();
        TradePositionUpdate::opened(dec!(50000), Utc::now()).apply_to(&mut p);
        p
    }

    #[test]
    fn test_terminal_initial_status_is_rejected() {
        let mut input = NewTradePosition {
            platform: "x".to_string(),
            status: PositionStatus::Closed,
            token: "BTC".to_string(),
            currency: "USDT".to_string(),
            size: dec!(1),
            amount_in: dec!(1),
            position_direction: PositionDirection::Short,
            leverage: 1,
            entry_price: dec!(1),
            take_profit_price: None,
            stop_loss_price: None,
        };
        assert!(input.clone().into_position(Uuid::new_v4(), Utc::now()).is_err());
        input.status = PositionStatus::Open;
        let pos = input.into_position(Uuid::new_v4(), Utc::now()).unwrap();
        assert!(pos.time_opened.is_some());
    }

    #[test]
    fn test_backward_transition_is_rejected() {
        let pos = opened();
        let back = TradePositionUpdate { status: Some(PositionStatus::Plan), ..Default::default() };
        assert_eq!(
            back.check_against(&pos),
            Err(UpdateRejection::IllegalTransition {
                from: PositionStatus::Open,
                to: PositionStatus::Plan
            })
        );
    }

    #[test]
    fn test_plan_cannot_skip_to_closed() {
        let pos = planned();
        let close: TradePositionUpdate = ClosePosition {
            status: PositionStatus::Closed,
            exit_price: dec!(1),
            amount_out: dec!(1),
            realized_pnl: dec!(0),
            time_closed: Utc::now(),
        }
        .into();
        assert!(matches!(
            close.check_against(&pos),
            Err(UpdateRejection::IllegalTransition { .. })
        ));
    }

    #[test]
    fn test_close_requires_both_settlement_fields() {
        let pos = opened();
        let no_amount = TradePositionUpdate {
            status: Some(PositionStatus::Closed),
            time_closed: Some(Utc::now()),
            ..Default::default()
        };
        assert_eq!(no_amount.check_against(&pos), Err(UpdateRejection::ClosedWithoutAmountOut));

        let no_time = TradePositionUpdate {
            status: Some(PositionStatus::Closed),
            amount_out: Some(dec!(10)),
            ..Default::default()
        };
        assert_eq!(
            no_time.check_against(&pos),
            Err(UpdateRejection::MissingSettlement(PositionStatus::Closed))
        );

        let time_only = TradePositionUpdate { time_closed: Some(Utc::now()), ..Default::default() };
        assert_eq!(time_only.check_against(&pos), Err(UpdateRejection::ClosedWithoutAmountOut));
    }

    #[test]
    fn test_settled_fields_are_written_once() {
        let mut pos = opened();
        let close: TradePositionUpdate = ClosePosition {
            status: PositionStatus::Closed,
            exit_price: dec!(51000),
            amount_out: dec!(110),
            realized_pnl: dec!(10),
            time_closed: Utc::now(),
        }
        .into();
        close.check_against(&pos).unwrap();
        close.apply_to(&mut pos);
        assert_eq!(
            close.check_against(&pos),
            Err(UpdateRejection::AlreadySettled(PositionStatus::Closed))
        );
    }

    #[test]
    fn test_exit_reason_long_and_short() {
        let mut pos = opened();
        assert_eq!(pos.exit_reason(), None);
        pos.current_price = Some(dec!(52000));
        assert_eq!(pos.exit_reason(), Some(ExitReason::TakeProfit));
        pos.current_price = Some(dec!(48000));
        assert_eq!(pos.exit_reason(), Some(ExitReason::StopLoss));

        pos.position_direction = PositionDirection::Short;
        pos.take_profit_price = Some(dec!(48500));
        pos.stop_loss_price = Some(dec!(51000));
        assert_eq!(pos.exit_reason(), Some(ExitReason::TakeProfit));
        pos.current_price = Some(dec!(51500));
        assert_eq!(pos.exit_reason(), Some(ExitReason::StopLoss));
        pos.current_price = Some(dec!(50000));
        assert_eq!(pos.exit_reason(), None);
    }

    #[test]
    fn test_exit_flag_wins_and_needs_open_status() {
        let mut pos = opened();
        pos.exit_flag = true;
        assert_eq!(pos.exit_reason(), Some(ExitReason::ExitFlag));
        let mut plan = planned();
        plan.exit_flag = true;
        assert_eq!(plan.exit_reason(), None);
    }
}
