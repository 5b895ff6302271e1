use crate::error::ApiError;
use async_trait::async_trait;
use core_types::PositionDirection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to open a position at market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    /// Reused across retries so the gateway can deduplicate.
    pub client_order_id: Uuid,
    pub symbol: String,
    pub direction: PositionDirection,
    /// Absolute base-asset quantity.
    pub size: Decimal,
    pub leverage: u32,
    /// Margin committed, already rounded to cents.
    pub margin: Decimal,
}

/// Request to flatten an open position at market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseOrder {
    pub client_order_id: Uuid,
    pub symbol: String,
    /// Direction of the position being closed, not of the closing order.
    pub direction: PositionDirection,
    pub size: Decimal,
}

/// An executed order as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    /// Average execution price.
    pub price: Decimal,
    pub size: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    /// Set when the exchange had already liquidated the position.
    #[serde(default)]
    pub liquidated: bool,
}

/// The exchange gateway as seen by the trading cycle.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn mark_price(&self, symbol: &str) -> Result<Decimal, ApiError>;

    async fn open_position(&self, order: &OpenOrder) -> Result<Fill, ApiError>;

    async fn close_position(&self, order: &CloseOrder) -> Result<Fill, ApiError>;
}
