//! # Sentinel Events
//!
//! Typed trade events and the bus that fans them out to listeners such as the
//! Telegram alerter.
//!
//! As a Layer 0 crate, it depends only on `core-types`.

// Declare the modules that make up this crate.
pub mod bus;
pub mod error;
pub mod messages;

// Re-export the core types to provide a clean public API.
pub use bus::{EventBus, ListenerId, Subscription};
pub use error::EventsError;
pub use messages::{PositionSummary, TradeEvent};
