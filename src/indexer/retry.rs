//! Delays between indexer iterations.

use std::{cmp, str::FromStr, time::Duration};

/// How the delay grows after consecutive failures.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Strategy {
    /// Always wait for the poll interval.
    #[default]
    Fixed,
    /// Double the poll interval with every consecutive failure.
    Exponential,
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            _ => anyhow::bail!("unknown retry strategy {s:?}"),
        }
    }
}

/// Tracks consecutive failures and computes the delay before the next
/// iteration.
#[derive(Clone, Debug)]
pub struct Backoff {
    strategy: Strategy,
    poll_interval: Duration,
    max_delay: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(strategy: Strategy, poll_interval: Duration, max_delay: Duration) -> Self {
        Self {
            strategy,
            poll_interval,
            max_delay,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn succeeded(&mut self) {
        self.failures = 0;
    }

    pub fn failed(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// The delay before the next iteration.
    pub fn delay(&self) -> Duration {
        match (self.strategy, self.failures) {
            (Strategy::Fixed, _) | (_, 0) => self.poll_interval,
            (Strategy::Exponential, failures) => {
                let factor = 2_u32.checked_pow(failures - 1).unwrap_or(u32::MAX);
                cmp::min(
                    self.poll_interval.saturating_mul(factor),
                    cmp::max(self.max_delay, self.poll_interval),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strategies() {
        assert_eq!("fixed".parse::<Strategy>().unwrap(), Strategy::Fixed);
        assert_eq!(
            "Exponential".parse::<Strategy>().unwrap(),
            Strategy::Exponential
        );
        assert!("linear".parse::<Strategy>().is_err());
    }

    #[test]
    fn fixed_delay() {
        let mut backoff = Backoff::new(
            Strategy::Fixed,
            Duration::from_millis(500),
            Duration::from_secs(60),
        );
        for _ in 0..5 {
            backoff.failed();
            assert_eq!(backoff.delay(), Duration::from_millis(500));
        }
    }

    #[test]
    fn exponential_delay() {
        let mut backoff = Backoff::new(
            Strategy::Exponential,
            Duration::from_millis(500),
            Duration::from_secs(3),
        );
        assert_eq!(backoff.delay(), Duration::from_millis(500));

        let delays = (0..5)
            .map(|_| {
                backoff.failed();
                backoff.delay()
            })
            .collect::<Vec<_>>();
        assert_eq!(
            delays,
            [500, 1000, 2000, 3000, 3000].map(Duration::from_millis)
        );

        backoff.succeeded();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.delay(), Duration::from_millis(500));
    }

    #[test]
    fn exponential_delay_saturates() {
        let mut backoff = Backoff::new(
            Strategy::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        for _ in 0..100 {
            backoff.failed();
        }
        assert_eq!(backoff.delay(), Duration::from_secs(60));
    }
}
