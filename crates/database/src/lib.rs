//! # Sentinel Database Crate
//!
//! The persistence adapter shared by every bot instance. It owns the two
//! records that must be consistent across instances: named lease locks and
//! trade positions.
//!
//! ## Architectural Principles
//!
//! - **Layer 3 Adapter:** All SQL lives here. The rest of the workspace talks to
//!   the `LockStore` and `PositionStore` traits.
//! - **Single-Statement Writes:** Every conditional write (claiming a lock,
//!   moving a position forward) is one statement, so the database arbitrates
//!   races between instances.
//! - **Swappable Backends:** In-memory implementations with identical rules
//!   back the tests and single-instance dry runs.
//!
//! ## Public API
//!
//! - `connect` / `run_migrations`: pool setup and schema management.
//! - `LockStore`, `PgLockStore`, `MemoryLockStore`: lease lock storage.
//! - `PositionStore`, `PgPositionStore`, `MemoryPositionStore`: position lifecycle.
//! - `DbError`: the specific error types that can be returned from this crate.

// Declare the modules that constitute this crate.
pub mod connection;
pub mod error;
pub mod locks;
pub mod positions;

// Re-export the key components to create a clean, public-facing API.
pub use connection::{connect, run_migrations};
pub use error::DbError;
pub use locks::{LockRecord, LockStore, MemoryLockStore, PgLockStore};
pub use positions::{
    MemoryPositionStore, PgPositionStore, PositionStore, UpdateOutcome, record_error,
    record_price, set_exit_flag,
};
