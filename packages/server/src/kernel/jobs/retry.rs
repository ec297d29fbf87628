//! Retry and backoff decisions.
//!
//! A pure function of the attempt count and the queue's retry settings.
//! Handler error contents never influence the schedule; the only hint the
//! engine honors is the `retriable` flag, which can park a job in `failed`
//! ahead of exhaustion.

use super::job::{Backoff, QueueConfig};

/// Default upper bound on any computed retry delay: 10 minutes.
pub const DEFAULT_BACKOFF_CEILING_MS: u64 = 600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-attempt after the given delay.
    Retry { delay_ms: u64 },
    /// Park in `failed`; only an explicit retry-failed revives the job.
    Park,
    /// Retries exhausted. Terminal.
    Dead,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
    pub ceiling_ms: u64,
}

impl RetryPolicy {
    pub fn from_queue(config: &QueueConfig, ceiling_ms: u64) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            backoff: config.backoff,
            ceiling_ms,
        }
    }

    /// Decide the fate of a job whose attempt number `attempts_so_far`
    /// (numbered from 1) just failed.
    pub fn decide(&self, attempts_so_far: u32, retriable: bool) -> RetryDecision {
        if attempts_so_far >= self.max_retries + 1 {
            return RetryDecision::Dead;
        }
        if !retriable {
            return RetryDecision::Park;
        }
        RetryDecision::Retry {
            delay_ms: self.delay_for(attempts_so_far),
        }
    }

    /// Delay before the attempt following `attempts_so_far`, clamped to the
    /// ceiling. Exponential growth doubles per failed attempt.
    pub fn delay_for(&self, attempts_so_far: u32) -> u64 {
        let raw = match self.backoff {
            Backoff::Fixed => self.retry_delay_ms,
            Backoff::Exponential => {
                let exponent = attempts_so_far.saturating_sub(1);
                match 2u64.checked_pow(exponent) {
                    Some(factor) => self.retry_delay_ms.saturating_mul(factor),
                    None => u64::MAX,
                }
            }
        };
        raw.min(self.ceiling_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, retry_delay_ms: u64, backoff: Backoff) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay_ms,
            backoff,
            ceiling_ms: DEFAULT_BACKOFF_CEILING_MS,
        }
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let p = policy(5, 1_000, Backoff::Fixed);
        for attempt in 1..=5 {
            assert_eq!(p.decide(attempt, true), RetryDecision::Retry { delay_ms: 1_000 });
        }
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let p = policy(3, 1_000, Backoff::Exponential);
        assert_eq!(p.delay_for(1), 1_000);
        assert_eq!(p.delay_for(2), 2_000);
        assert_eq!(p.delay_for(3), 4_000);
    }

    #[test]
    fn delay_clamps_to_ceiling() {
        let p = RetryPolicy {
            max_retries: 30,
            retry_delay_ms: 1_000,
            backoff: Backoff::Exponential,
            ceiling_ms: 600_000,
        };
        assert_eq!(p.delay_for(20), 600_000);
        // overflow territory still clamps
        assert_eq!(p.delay_for(70), 600_000);
    }

    #[test]
    fn exhausted_attempts_are_dead() {
        let p = policy(3, 1_000, Backoff::Fixed);
        assert_eq!(p.decide(4, true), RetryDecision::Dead);
        assert_eq!(p.decide(5, true), RetryDecision::Dead);
    }

    #[test]
    fn zero_max_retries_dies_on_first_failure() {
        let p = policy(0, 1_000, Backoff::Fixed);
        assert_eq!(p.decide(1, true), RetryDecision::Dead);
    }

    #[test]
    fn non_retriable_parks_while_attempts_remain() {
        let p = policy(3, 1_000, Backoff::Fixed);
        assert_eq!(p.decide(1, false), RetryDecision::Park);
    }

    #[test]
    fn non_retriable_on_last_attempt_is_dead() {
        let p = policy(1, 1_000, Backoff::Fixed);
        assert_eq!(p.decide(2, false), RetryDecision::Dead);
    }

    #[test]
    fn schedule_matches_documented_example() {
        // max_retries=3, delay=1000ms, exponential: attempts at ~0s, 1s, 3s, 7s
        let p = policy(3, 1_000, Backoff::Exponential);
        let mut elapsed = 0u64;
        let mut schedule = vec![0u64];
        for attempt in 1..=3 {
            match p.decide(attempt, true) {
                RetryDecision::Retry { delay_ms } => {
                    elapsed += delay_ms;
                    schedule.push(elapsed);
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert_eq!(schedule, vec![0, 1_000, 3_000, 7_000]);
        assert_eq!(p.decide(4, true), RetryDecision::Dead);
    }
}
