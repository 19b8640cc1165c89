//! Poll scheduling with fixed or exponential backoff.

use std::time::Duration;

/// Spacing between successive status checks of one job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed { delay: Duration },
    /// `base * factor^attempt`, never above `max`. With `jitter` the delay is
    /// spread uniformly over half to one and a half times that value.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Delay following poll `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let grown = (base.as_secs_f64() * factor.powi(exponent)).min(max.as_secs_f64());
                let nominal_ms = (grown * 1_000.0).round() as u64;
                if !jitter {
                    return Duration::from_millis(nominal_ms);
                }
                let spread = nominal_ms / 2;
                Duration::from_millis(nominal_ms - spread + fastrand::u64(0..=spread * 2))
            }
        }
    }
}

/// Timing rules for one asynchronous job: first poll delay, spacing, and the
/// wall-clock ceiling measured from submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSchedule {
    pub initial_delay: Duration,
    pub backoff: Backoff,
    pub timeout: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff: Backoff::default(),
            timeout: Duration::from_secs(500),
        }
    }
}

impl PollSchedule {
    /// Fixed-interval schedule with no initial delay.
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            backoff: Backoff::Fixed { delay: interval },
            timeout,
        }
    }

    /// Delay to wait after the given poll attempt (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_ignores_the_attempt_number() {
        let backoff = Backoff::Fixed {
            delay: Duration::from_millis(750),
        };

        assert_eq!(backoff.delay(0), backoff.delay(25));
    }

    #[test]
    fn exponential_backoff_doubles_until_the_cap() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(2),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: false,
        };

        let delays: Vec<u64> = (0..6).map(|attempt| backoff.delay(attempt).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn jittered_backoff_stays_within_half_of_nominal() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(4),
            factor: 1.5,
            max: Duration::from_secs(60),
            jitter: true,
        };

        for attempt in 0..4 {
            let nominal = 4_000.0 * 1.5_f64.powi(attempt as i32);
            for _ in 0..20 {
                let delay_ms = backoff.delay(attempt).as_millis() as f64;
                assert!(delay_ms >= nominal * 0.5 - 1.0, "attempt {attempt}: {delay_ms}");
                assert!(delay_ms <= nominal * 1.5 + 1.0, "attempt {attempt}: {delay_ms}");
            }
        }
    }

    #[test]
    fn default_schedule_polls_every_ten_seconds_after_one_second() {
        let schedule = PollSchedule::default();

        assert_eq!(schedule.initial_delay, Duration::from_secs(1));
        assert_eq!(schedule.delay_after(0), Duration::from_secs(10));
        assert_eq!(schedule.delay_after(7), Duration::from_secs(10));
        assert_eq!(schedule.timeout, Duration::from_secs(500));
    }

    #[test]
    fn fixed_schedule_starts_polling_immediately() {
        let schedule = PollSchedule::fixed(Duration::from_secs(10), Duration::from_secs(30));

        assert_eq!(schedule.initial_delay, Duration::ZERO);
        assert_eq!(schedule.delay_after(2), Duration::from_secs(10));
    }
}
