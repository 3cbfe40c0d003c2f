//! Wall-clock budgets for timed protocol steps.
//!
//! A coarse side-channel tripwire: an operation that runs far longer than
//! expected is treated as suspect and its result discarded. The budgets are
//! configuration, not a security guarantee.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Run `op` and fail with `TIMING_ANOMALY` if it exceeded `budget`
///
/// The operation's own error wins over the timing check.
pub fn guarded<T>(operation: &'static str, budget: Duration, op: impl FnOnce() -> Result<T>) -> Result<T> {
    let started = Instant::now();
    let value = op()?;
    check(operation, budget, started.elapsed())?;
    Ok(value)
}

/// Compare a measured duration against its budget
pub fn check(operation: &'static str, budget: Duration, elapsed: Duration) -> Result<()> {
    if elapsed > budget {
        tracing::warn!(
            "Timing anomaly in {}: {:?} exceeds budget {:?}",
            operation,
            elapsed,
            budget
        );
        return Err(Error::TimingAnomaly {
            operation,
            elapsed_ms: elapsed.as_millis() as u64,
            budget_ms: budget.as_millis() as u64,
        });
    }
    Ok(())
}
