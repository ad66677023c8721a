//! Duration measurement for production passes and poll cycles.

use std::time::Instant;
use tracing::debug;

/// Measures the wall time of a named operation.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: &'static str,
}

impl SpanTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// The operation name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stops the timer, logs the duration at debug level and returns it.
    pub fn finish(self) -> f64 {
        let elapsed = self.elapsed_ms();
        debug!(span = self.name, duration_ms = elapsed, "span finished");
        elapsed
    }
}
