//! # Sentinel Retry Crate
//!
//! A bounded retry executor for unreliable remote calls. Decisions branch on an
//! explicit error kind (see `Classify`) rather than on error messages:
//! transient kinds are retried after a fixed delay, stop kinds end the run at
//! once and, unless benign, are broadcast on an abort channel.
//!
//! The executor knows nothing about locks, exchanges or positions.

// Declare the modules that make up this crate.
pub mod error;
pub mod executor;
pub mod policy;

// Re-export the core types to provide a clean public API.
pub use error::{AbortedError, RetryFailure, StopReason};
pub use executor::{EndPredicate, Retry};
pub use policy::{Classify, RetryPolicy};
