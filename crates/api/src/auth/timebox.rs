//! Minimum-duration envelope for credential checks
//!
//! The wrapped future runs to completion, then the caller waits out whatever
//! is left of the floor. Checks that take longer than the floor return as
//! soon as they finish.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Flag the wrapped check can raise when it bails out early.
///
/// It is recorded for diagnostics only and never shortens the floor.
#[derive(Debug, Clone, Default)]
pub struct EarlyReturn(Arc<AtomicBool>);

impl EarlyReturn {
    pub fn signal(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_signalled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timebox {
    floor: Duration,
}

impl Timebox {
    pub fn new(floor: Duration) -> Self {
        Self { floor }
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    /// Run `check`, taking at least `floor` of wall-clock time in total
    pub async fn run<F, Fut, T>(&self, check: F) -> T
    where
        F: FnOnce(EarlyReturn) -> Fut,
        Fut: Future<Output = T>,
    {
        let started = Instant::now();
        let early = EarlyReturn::default();

        let output = check(early.clone()).await;

        let elapsed = started.elapsed();
        if let Some(remaining) = self.floor.checked_sub(elapsed) {
            sleep(remaining).await;
        }

        tracing::trace!(
            elapsed_us = elapsed.as_micros() as u64,
            short_circuited = early.is_signalled(),
            "timeboxed check finished"
        );
        output
    }
}
