use std::time::Instant;

/// Source of monotonic time in seconds.
///
/// All stream timers (retransmission, handshake resend, close deadline) are
/// expressed as monotonic seconds so that tests can substitute a manually
/// stepped clock.
pub trait TimeSource: Send + Sync + 'static {
    fn now_seconds(&self) -> f64;
}

/// Wall-clock independent time source backed by [`Instant`].
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_seconds(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Manually stepped clock for deterministic timer tests.
#[cfg(test)]
pub(crate) struct ManualClock {
    now: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> ManualClock {
        ManualClock {
            now: std::sync::atomic::AtomicU64::new(0f64.to_bits()),
        }
    }

    pub(crate) fn advance(&self, seconds: f64) {
        let next = self.now_seconds() + seconds;
        self.now
            .store(next.to_bits(), std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl TimeSource for ManualClock {
    fn now_seconds(&self) -> f64 {
        f64::from_bits(self.now.load(std::sync::atomic::Ordering::SeqCst))
    }
}
