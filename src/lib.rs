//! Provider Acceptance-Test Gates
//!
//! Admission control for acceptance tests (and resource handlers) that share
//! one rate-limited cloud account. Callers pass an opaque string key naming
//! the resource or test scope and wrap their critical section in one of two
//! gates.
//!
//! # Overview
//!
//! - **[`BatchExecutor`]**: admits at most `capacity` callers at once. When the
//!   last admitted caller releases while others are waiting, it pauses for
//!   `cooldown` before the next cohort is let in.
//! - **[`SequentialGate`]**: a per-key announcement point. `enter` wakes anyone
//!   listening on the key and returns at once; it never waits for earlier
//!   occupants and is not a mutex.
//! - **Process-wide instances**: [`batch_executor`] and [`sequential_gate`].
//! - **Test harness**: [`testing::GatedTester`] runs test bodies and step lists
//!   behind both gates.
//! - **Logging**: structured `tracing` events on every gate transition.
//!
//! Neither gate has timeouts or deadlock detection on its core path: a batch
//! slot that is never released starves every other caller. See
//! [`BatchExecutor::acquire_timeout`] for a bounded alternative.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use provider_acctest_gate::{BatchExecutor, SequentialGate};
//!
//! let executor = BatchExecutor::new(3, Duration::from_secs(120));
//! let gate = SequentialGate::new();
//!
//! let id = executor.run("is_share", || {
//!     gate.run("is_share", || {
//!         // create, check and destroy the share
//!         "r006-share"
//!     })
//! });
//! assert_eq!(id, "r006-share");
//! assert_eq!(executor.active(), 0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod config;
pub mod error;
pub mod global;
pub mod logging;
pub mod sequential;
pub mod testing;

// Re-export main types at crate root
pub use batch::{BatchExecutor, BatchPermit, BatchSnapshot};
pub use config::{BatchConfig, DEFAULT_CAPACITY, DEFAULT_COOLDOWN};
pub use error::GateError;
pub use global::{batch_executor, init_batch_executor, sequential_gate};
pub use logging::{init_logging, init_logging_with_default, init_test_logging, try_init_logging};
pub use sequential::SequentialGate;

// Re-export commonly used external types
pub use tracing;
