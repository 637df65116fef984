//! Back-off builders for the queue poller.
//!
//! Uses `backon` for exponential backoff with jitter. Sequences are finite;
//! callers hold the ceiling once a sequence runs out.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

use crate::config::PollingConfig;

/// Steps before an idle sequence settles at its ceiling.
const IDLE_STEPS: usize = 16;

/// Steps before an error sequence settles at its ceiling.
const ERROR_STEPS: usize = 8;

/// Backoff between empty reads.
///
/// - Min delay: `idle_min_ms`
/// - Max delay: `idle_max_ms`
/// - No jitter
pub fn idle_backoff(polling: &PollingConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(polling.idle_min_ms))
        .with_max_delay(Duration::from_millis(polling.idle_max_ms.max(polling.idle_min_ms)))
        .with_max_times(IDLE_STEPS)
}

/// Backoff after a transient provider error.
///
/// - Min delay: a tenth of `error_backoff_ms`
/// - Max delay: `error_backoff_ms`
/// - Jitter enabled
pub fn error_backoff(polling: &PollingConfig) -> ExponentialBuilder {
    let ceiling = Duration::from_millis(polling.error_backoff_ms);
    ExponentialBuilder::default()
        .with_min_delay(ceiling / 10)
        .with_max_delay(ceiling)
        .with_max_times(ERROR_STEPS)
        .with_jitter()
}

/// Restartable delay sequence that holds its ceiling once exhausted.
pub struct Pacer {
    builder: ExponentialBuilder,
    ceiling: Duration,
    current: ExponentialBackoff,
}

impl Pacer {
    pub fn new(builder: ExponentialBuilder, ceiling: Duration) -> Self {
        let current = builder.clone().build();
        Self {
            builder,
            ceiling,
            current,
        }
    }

    /// Next delay in the sequence.
    pub fn next_delay(&mut self) -> Duration {
        self.current
            .next()
            .map(|d| d.min(self.ceiling))
            .unwrap_or(self.ceiling)
    }

    /// Start over from the minimum delay.
    pub fn reset(&mut self) {
        self.current = self.builder.clone().build();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polling() -> PollingConfig {
        PollingConfig {
            idle_min_ms: 10,
            idle_max_ms: 40,
            error_backoff_ms: 100,
            dedup_capacity: 10,
        }
    }

    #[test]
    fn test_idle_pacer_grows_to_ceiling() {
        let ceiling = Duration::from_millis(40);
        let mut pacer = Pacer::new(idle_backoff(&polling()), ceiling);

        let first = pacer.next_delay();
        assert_eq!(first, Duration::from_millis(10));
        for _ in 0..64 {
            assert!(pacer.next_delay() <= ceiling);
        }
        assert_eq!(pacer.next_delay(), ceiling);
    }

    #[test]
    fn test_pacer_reset_restarts_sequence() {
        let mut pacer = Pacer::new(idle_backoff(&polling()), Duration::from_millis(40));
        pacer.next_delay();
        pacer.next_delay();
        pacer.reset();
        assert_eq!(pacer.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_error_backoff_is_bounded() {
        let ceiling = Duration::from_millis(100);
        let mut pacer = Pacer::new(error_backoff(&polling()), ceiling);
        for _ in 0..32 {
            assert!(pacer.next_delay() <= ceiling);
        }
    }
}
