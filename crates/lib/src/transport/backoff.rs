//! Reconnect delay: exponential from a floor, capped, with random jitter.

use crate::config::ReconnectConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            floor,
            cap: cap.max(floor),
            attempt: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.floor_ms),
            Duration::from_millis(config.cap_ms),
        )
    }

    /// Delay before jitter for the given attempt (0-based): floor * 2^attempt, capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.floor.saturating_mul(factor).min(self.cap)
    }

    /// Delay for the next attempt, with jitter in [0, base/2), never above the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        (base + jitter(base / 2)).min(self.cap)
    }

    /// Call after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return Duration::ZERO;
    }
    Duration::from_millis(u64::from_le_bytes(bytes) % max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_until_cap() {
        let b = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        assert_eq!(b.base_delay(0), Duration::from_millis(500));
        assert_eq!(b.base_delay(1), Duration::from_secs(1));
        assert_eq!(b.base_delay(3), Duration::from_secs(4));
        assert_eq!(b.base_delay(10), Duration::from_secs(30));
        assert_eq!(b.base_delay(200), Duration::from_secs(30));
    }

    #[test]
    fn next_delay_stays_within_jitter_window() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        for attempt in 0..20 {
            let base = b.base_delay(attempt);
            let d = b.next_delay();
            assert!(d >= base, "attempt {attempt}: {d:?} < {base:?}");
            assert!(d <= Duration::from_secs(1));
            assert!(d < base + base / 2 + Duration::from_millis(1));
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert!(b.next_delay() < Duration::from_millis(15));
    }
}
