//! Wait-interval computation for throttled, retried queries.

use std::time::Duration;

use rand::Rng;

/// Largest exponent applied to the throttle interval. Keeps the delay of a
/// long-retrying packet bounded instead of doubling forever.
const MAX_EXPONENT: u32 = 16;

/// Exponential backoff anchored on a throttle interval: attempt `n` waits
/// `throttle * 2^n`. The throttle itself doubles as the minimum gap between
/// successive queries (attempt 0 still waits one throttle interval).
#[derive(Debug, Clone)]
pub struct Backoff {
    throttle: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(throttle: Duration) -> Self {
        Self {
            throttle,
            jitter: false,
        }
    }

    /// Adds +/- 20% jitter to every computed delay.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    /// Replaces the throttle interval, e.g. after a server reported its
    /// rate limit.
    pub fn set_throttle(&mut self, throttle: Duration) {
        self.throttle = throttle;
    }

    /// Wait time before the attempt with the given 0-based number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(MAX_EXPONENT);
        let base = self.throttle.saturating_mul(1 << exp);

        if !self.jitter {
            return base;
        }

        let jitter_factor = rand::rng().random_range(0.8..1.2);
        base.mul_f64(jitter_factor)
    }
}

/// Converts a server-reported rate limit (N requests per interval) into the
/// minimum gap to keep between successive requests.
///
/// The interval is given as a number suffixed with `s`, `m` or `h`, the way
/// Crossref reports it in its `X-Rate-Limit-Interval` header.
pub fn rate_limit_gap(limit: u64, interval: &str) -> Option<Duration> {
    if limit == 0 {
        return None;
    }

    let (number, unit) = interval.split_at(interval.len().checked_sub(1)?);
    let amount: u64 = number.trim().parse().ok()?;
    if amount == 0 {
        return None;
    }

    let interval_ms = match unit {
        "s" => amount * 1000,
        "m" => amount * 60 * 1000,
        "h" => amount * 3600 * 1000,
        _ => return None,
    };

    Some(Duration::from_millis(interval_ms / limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_non_decreasing() {
        let backoff = Backoff::new(Duration::from_millis(200));
        let delays: Vec<_> = (0..8).map(|n| backoff.delay(n)).collect();

        assert_eq!(delays[0], Duration::from_millis(200));
        assert_eq!(delays[1], Duration::from_millis(400));
        assert_eq!(delays[2], Duration::from_millis(800));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn exponent_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(1));
        assert_eq!(backoff.delay(100), backoff.delay(MAX_EXPONENT));
    }

    #[test]
    fn jitter_stays_within_20_percent() {
        let backoff = Backoff::new(Duration::from_millis(1000)).with_jitter();

        for attempt in 0..4 {
            let base = Duration::from_millis(1000).saturating_mul(1 << attempt);
            let delay = backoff.delay(attempt);
            assert!(delay >= base.mul_f64(0.8));
            assert!(delay <= base.mul_f64(1.2));
        }
    }

    #[test]
    fn rate_limit_gap_from_header_values() {
        assert_eq!(rate_limit_gap(50, "1s"), Some(Duration::from_millis(20)));
        assert_eq!(rate_limit_gap(60, "1m"), Some(Duration::from_millis(1000)));
        assert_eq!(rate_limit_gap(10, "1h"), Some(Duration::from_secs(360)));
    }

    #[test]
    fn rate_limit_gap_rejects_malformed_input() {
        assert_eq!(rate_limit_gap(0, "1s"), None);
        assert_eq!(rate_limit_gap(50, "0s"), None);
        assert_eq!(rate_limit_gap(50, "1x"), None);
        assert_eq!(rate_limit_gap(50, ""), None);
        assert_eq!(rate_limit_gap(50, "abc"), None);
    }
}
