use std::time::Duration;

/// What the view does when a stream drops under a still-displayed
/// conversation. The engine itself never reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Never,
    /// Doubling delays from `initial`, capped at `max`. `max_attempts` of 0
    /// retries forever.
    Backoff {
        initial: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Never
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> Option<Backoff> {
        match self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::Backoff { initial, max, max_attempts } =>
                Some(Backoff {
                    initial: *initial,
                    max: *max,
                    max_attempts: *max_attempts,
                    attempt: 0,
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    /// `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts != 0 && self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        let delay = self.initial.saturating_mul(factor).min(self.max);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_has_no_backoff() {
        assert!(ReconnectPolicy::default().backoff().is_none());
    }

    #[test]
    fn delays_double_then_cap_and_stop() {
        let policy = ReconnectPolicy::Backoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(3),
            max_attempts: 5,
        };
        let mut backoff = policy.backoff().unwrap();
        let delays: Vec<Duration> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3)
            ]
        );
        assert_eq!(backoff.attempts(), 5);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn zero_attempts_means_unbounded() {
        let policy = ReconnectPolicy::Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 0,
        };
        let mut backoff = policy.backoff().unwrap();
        for _ in 0..100 {
            assert!(backoff.next_delay().unwrap() <= Duration::from_secs(60));
        }
    }
}
