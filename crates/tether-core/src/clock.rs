use std::sync::atomic::{AtomicI64, Ordering};

/// Millisecond clock that never hands out the same value twice.
///
/// Message timestamps double as identities and supersession markers, so two
/// entries created within the same millisecond must still compare distinct.
#[derive(Debug, Default)]
pub struct MessageClock {
    last: AtomicI64,
}

impl MessageClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Moves the clock forward past timestamps loaded from disk.
    pub fn observe(&self, ts: i64) {
        self.last.fetch_max(ts, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_strictly_increasing() {
        let clock = MessageClock::new();
        let mut prev = clock.next();
        for _ in 0..1000 {
            let ts = clock.next();
            assert!(ts > prev);
            prev = ts;
        }
    }

    #[test]
    fn observe_skips_past_restored_timestamps() {
        let clock = MessageClock::new();
        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        clock.observe(future);
        assert!(clock.next() > future);
    }
}
