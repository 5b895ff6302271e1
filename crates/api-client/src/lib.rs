//! # Sentinel API Client
//!
//! Everything the bot says to the outside world goes through here: the
//! exchange gateway (`Exchange`) and the model service (`SignalSource`).
//! Failures are classified into an `ErrorKind` so the retry executor can tell
//! transient errors from permanent ones.

// Declare the modules that make up this crate.
pub mod classify;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod paper;
pub mod responses;
pub mod signals;

// --- Public API ---
pub use classify::{ErrorKind, classify_code, classify_status};
pub use error::ApiError;
pub use exchange::{CloseOrder, Exchange, Fill, OpenOrder};
pub use gateway::GatewayClient;
pub use paper::{PaperCall, PaperExchange};
pub use signals::{HttpSignalSource, IdleSignals, SignalSource};
