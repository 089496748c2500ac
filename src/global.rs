//! Process-wide gate instances shared by every test in a run.
//!
//! The batch executor is built on first use from [`BatchConfig::from_env`].
//! Call [`init_batch_executor`] before any test touches it to pin an explicit
//! configuration instead.

use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use crate::batch::{self, BatchExecutor};
use crate::config::BatchConfig;
use crate::error::GateError;
use crate::sequential::SequentialGate;

static BATCH_EXECUTOR: OnceLock<BatchExecutor> = OnceLock::new();
static SEQUENTIAL_GATE: OnceLock<Arc<SequentialGate>> = OnceLock::new();

/// The shared batch executor.
pub fn batch_executor() -> &'static BatchExecutor {
    BATCH_EXECUTOR.get_or_init(|| {
        let config = BatchConfig::from_env().unwrap_or_else(|err| {
            warn!(error = %err, "ignoring batch configuration from environment");
            BatchConfig::default()
        });
        build(config)
    })
}

/// Install the shared batch executor with an explicit configuration.
///
/// Fails with [`GateError::AlreadyInitialized`] once the executor exists,
/// including when [`batch_executor`] has already built it lazily.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use provider_acctest_gate::{batch_executor, init_batch_executor, BatchConfig, GateError};
///
/// let config = BatchConfig::new()
///     .with_capacity(2)
///     .with_cooldown(Duration::from_secs(60));
/// init_batch_executor(config).unwrap();
///
/// assert_eq!(batch_executor().capacity(), 2);
/// assert!(matches!(
///     init_batch_executor(config),
///     Err(GateError::AlreadyInitialized)
/// ));
/// ```
pub fn init_batch_executor(config: BatchConfig) -> Result<(), GateError> {
    config.validate()?;

    let mut installed = false;
    BATCH_EXECUTOR.get_or_init(|| {
        installed = true;
        build(config)
    });

    if installed {
        Ok(())
    } else {
        Err(GateError::AlreadyInitialized)
    }
}

/// The shared sequential gate.
pub fn sequential_gate() -> &'static SequentialGate {
    shared_sequential_gate()
}

pub(crate) fn shared_sequential_gate() -> &'static Arc<SequentialGate> {
    SEQUENTIAL_GATE.get_or_init(|| Arc::new(SequentialGate::new()))
}

fn build(config: BatchConfig) -> BatchExecutor {
    info!(
        capacity = config.capacity,
        cooldown_ms = batch::as_millis(config.cooldown),
        "initialized global batch executor"
    );
    BatchExecutor::new(config.capacity, config.cooldown)
}
