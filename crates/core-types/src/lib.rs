//! # Sentinel Core Types
//!
//! The shared vocabulary of the workspace: the trade position record and its
//! lifecycle rules, and the precision module every money amount passes through.
//!
//! As a Layer 0 crate it has no knowledge of storage, exchanges or scheduling.

pub mod enums;
pub mod error;
pub mod precision;
pub mod structs;

// Re-export the core types to provide a clean public API.
pub use enums::{ExitReason, PositionDirection, PositionStatus};
pub use error::CoreError;
pub use precision::{calculate_quote_amount, round_cents, round_to_cents, round_to_decimals};
pub use structs::{
    ClosePosition, NewTradePosition, TradePosition, TradePositionUpdate, TradeSignal,
    UpdateRejection,
};
