//! Reconnection backoff for the daemon supervisor.
//!
//! Exponential backoff with random jitter, reset after a connection that
//! got as far as tip-follow.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed
    pub jitter: f64,
    /// 0 = unlimited
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(300), // 5 minutes max
            multiplier: 1.5,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

/// Running backoff state for one supervisor.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        if self.attempts > 0 {
            debug!("Backoff reset after {} attempt(s)", self.attempts);
        }
        self.attempts = 0;
    }

    /// Delay before the next attempt without jitter.
    pub fn base_delay(&self) -> Duration {
        let exp = self.policy.multiplier.powi(self.attempts.min(64) as i32);
        let secs = self.policy.initial.as_secs_f64() * exp;
        Duration::from_secs_f64(secs.min(self.policy.max.as_secs_f64()))
    }

    /// Delay before the next attempt, or `None` once attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.max_attempts != 0 && self.attempts >= self.policy.max_attempts {
            return None;
        }
        let base = self.base_delay();
        self.attempts += 1;

        if self.policy.jitter <= 0.0 {
            return Some(base);
        }
        let spread = rand::thread_rng().gen_range(-self.policy.jitter..=self.policy.jitter);
        let secs = (base.as_secs_f64() * (1.0 + spread)).max(0.0);
        Some(Duration::from_secs_f64(secs.min(self.policy.max.as_secs_f64())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, jitter: f64) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(10),
            multiplier: 1.5,
            jitter,
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(policy(0, 0.0));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(3)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs_f64(4.5)));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(10)));

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_attempt_limit() {
        let mut backoff = Backoff::new(policy(2, 0.0));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = Backoff::new(policy(0, 0.2));
        for _ in 0..50 {
            backoff.reset();
            let d = backoff.next_delay().unwrap().as_secs_f64();
            assert!((1.6..=2.4).contains(&d), "delay {} out of range", d);
        }
    }
}
