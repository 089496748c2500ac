//! Acceptance-test harness built on the gates.
//!
//! [`GatedTester`] wraps test bodies so that at most `capacity` of them run
//! against the cloud account at once, and announces each step of a test case
//! on the [`SequentialGate`].
//!
//! # Example
//!
//! ```ignore
//! use provider_acctest_gate::testing::{GatedTester, TestStep};
//!
//! #[test]
//! fn test_acc_is_share_basic() {
//!     let tester = GatedTester::global();
//!
//!     tester
//!         .run_steps("is_share", vec![
//!             TestStep::new("create", || create_share("acc-share")),
//!             TestStep::new("update", || resize_share("acc-share", 200)),
//!             TestStep::new("destroy", || delete_share("acc-share")),
//!         ])
//!         .unwrap();
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::batch::{BatchExecutor, BatchPermit};
use crate::config::BatchConfig;
use crate::error::GateError;
use crate::global;
use crate::sequential::SequentialGate;

/// Runs acceptance-test bodies behind a [`BatchExecutor`] and a
/// [`SequentialGate`].
#[derive(Debug, Clone)]
pub struct GatedTester {
    batch: BatchExecutor,
    sequential: Arc<SequentialGate>,
}

impl GatedTester {
    /// Create a tester from explicit gates.
    pub fn new(batch: BatchExecutor, sequential: Arc<SequentialGate>) -> Self {
        Self { batch, sequential }
    }

    /// Create a tester with private gates built from `config`.
    pub fn from_config(config: BatchConfig) -> Result<Self, GateError> {
        Ok(Self::new(
            BatchExecutor::from_config(config)?,
            Arc::new(SequentialGate::new()),
        ))
    }

    /// Create a tester on the process-wide gates.
    pub fn global() -> Self {
        Self::new(
            global::batch_executor().clone(),
            Arc::clone(global::shared_sequential_gate()),
        )
    }

    /// The batch executor used by this tester.
    pub fn batch(&self) -> &BatchExecutor {
        &self.batch
    }

    /// The sequential gate used by this tester.
    pub fn sequential(&self) -> &SequentialGate {
        &self.sequential
    }

    // =========================================================================
    // Gated execution
    // =========================================================================

    /// Run `f` while holding a batch slot for `key`.
    pub fn run_batched<F, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.batch.run(key, f)
    }

    /// Run the future produced by `f` while holding a batch slot for `key`.
    ///
    /// Admission and release happen on tokio's blocking pool, so neither the
    /// wait nor a drain cooldown stalls the runtime. This also holds when the
    /// body panics or the returned future is dropped before completion.
    pub async fn run_batched_async<F, Fut, T>(&self, key: &str, f: F) -> Result<T, GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let batch = self.batch.clone();
        let owned_key = key.to_string();
        let permit = tokio::task::spawn_blocking(move || batch.acquire(&owned_key)).await?;
        let mut guard = BlockingRelease(Some(permit));

        let output = f().await;

        if let Some(permit) = guard.0.take() {
            tokio::task::spawn_blocking(move || permit.release()).await?;
        }
        Ok(output)
    }

    /// Run the steps of one test case in order, inside a single batch slot.
    ///
    /// Each step is announced with [`SequentialGate::enter`] on `key`.
    /// Execution stops at the first failing step. Returns the number of
    /// steps run.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use provider_acctest_gate::testing::{GatedTester, TestError, TestStep};
    /// use provider_acctest_gate::BatchConfig;
    ///
    /// let tester = GatedTester::from_config(
    ///     BatchConfig::new().with_capacity(1).with_cooldown(Duration::ZERO),
    /// )
    /// .unwrap();
    ///
    /// let err = tester
    ///     .run_steps("is_share", vec![
    ///         TestStep::new("create", || Ok::<(), String>(())),
    ///         TestStep::new("resize", || Err("size must grow")),
    ///     ])
    ///     .unwrap_err();
    ///
    /// assert!(matches!(err, TestError::Step { index: 1, .. }));
    /// ```
    pub fn run_steps(&self, key: &str, steps: Vec<TestStep>) -> Result<usize, TestError> {
        let total = steps.len();
        let _permit = self.batch.acquire(key);

        for (index, step) in steps.into_iter().enumerate() {
            debug!(key, step = %step.name, index, total, "running test step");

            self.sequential.enter(key);
            let result = (step.check)();
            self.sequential.exit(key);

            if let Err(message) = result {
                warn!(key, step = %step.name, index, %message, "test step failed");
                return Err(TestError::Step {
                    key: key.to_string(),
                    step: step.name,
                    index,
                    message,
                });
            }
        }

        Ok(total)
    }
}

/// Hands a permit to the blocking pool when dropped outside the normal
/// release path, so a drain cooldown never sleeps on a runtime worker.
struct BlockingRelease(Option<BatchPermit>);

impl Drop for BlockingRelease {
    fn drop(&mut self) {
        let Some(permit) = self.0.take() else {
            return;
        };
        debug!(key = permit.key(), "releasing abandoned batch slot");
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || permit.release());
            }
            Err(_) => permit.release(),
        }
    }
}

/// One named step of an acceptance-test case.
pub struct TestStep {
    name: String,
    check: Box<dyn FnOnce() -> Result<(), String> + Send>,
}

impl TestStep {
    /// Create a step from a fallible closure.
    pub fn new<F, E>(name: impl Into<String>, check: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        Self {
            name: name.into(),
            check: Box::new(move || check().map_err(|e| e.to_string())),
        }
    }

    /// The step's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestStep").field("name", &self.name).finish()
    }
}

/// Error type for gated test runs.
#[derive(Debug)]
pub enum TestError {
    /// A step returned an error.
    Step {
        /// The test case key.
        key: String,
        /// The failing step's name.
        step: String,
        /// Zero-based position of the failing step.
        index: usize,
        /// The step's error message.
        message: String,
    },
    /// A gate operation failed.
    Gate(GateError),
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestError::Step {
                key,
                step,
                index,
                message,
            } => write!(f, "{} step {} ({}) failed: {}", key, index, step, message),
            TestError::Gate(e) => write!(f, "Gate error: {}", e),
        }
    }
}

impl std::error::Error for TestError {}

impl From<GateError> for TestError {
    fn from(e: GateError) -> Self {
        TestError::Gate(e)
    }
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that nobody holds or waits for a slot.
///
/// # Panics
///
/// Panics if any caller is admitted or waiting.
pub fn assert_idle(executor: &BatchExecutor) {
    let snapshot = executor.snapshot();
    assert!(
        snapshot.active == 0 && snapshot.waiting == 0,
        "Expected idle batch executor, but got {} active and {} waiting",
        snapshot.active,
        snapshot.waiting
    );
}

/// Assert that at most `max` callers are admitted.
///
/// # Panics
///
/// Panics if more than `max` callers hold a slot.
pub fn assert_active_at_most(executor: &BatchExecutor, max: usize) {
    let active = executor.active();
    assert!(
        active <= max,
        "Expected at most {} active caller(s), but got {}",
        max,
        active
    );
}
