use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::HarnessError;

/// How the delay between two attempts is computed.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitStrategy {
    Constant { interval: Duration },
    Exponential { base: Duration, ceiling: Duration },
}

/// Retry schedule shared by every poll loop of the harness.
///
/// Policies are immutable values and carry no state between attempts, so the
/// same inputs always produce the same delay and give-up decision.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub wait: WaitStrategy,
    /// `None` only when an unbounded policy was asked for explicitly.
    pub max_elapsed: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn constant(interval: Duration, max_elapsed: Duration) -> Self {
        Self {
            wait: WaitStrategy::Constant { interval },
            max_elapsed: Some(max_elapsed),
            max_attempts: None,
            jitter: false,
        }
    }

    pub fn exponential(base: Duration, ceiling: Duration, max_elapsed: Duration) -> Self {
        Self {
            wait: WaitStrategy::Exponential { base, ceiling },
            max_elapsed: Some(max_elapsed),
            max_attempts: None,
            jitter: false,
        }
    }

    /// A policy that never gives up on its own; callers must bound it with
    /// `with_max_attempts` or an outer timeout.
    pub fn unbounded(wait: WaitStrategy) -> Self {
        Self {
            wait,
            max_elapsed: None,
            max_attempts: None,
            jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the attempt following `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match &self.wait {
            WaitStrategy::Constant { interval } => *interval,
            WaitStrategy::Exponential { base, ceiling } => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(*ceiling).min(*ceiling)
            }
        }
    }

    /// Full jitter over `delay(attempt)` when the policy asks for it.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        Duration::from_secs_f64(rng.gen_range(0.0..=delay.as_secs_f64()))
    }

    /// Whether a caller that has made `attempts` attempts over `elapsed`
    /// must stop retrying.
    pub fn is_exhausted(&self, elapsed: Duration, attempts: u32) -> bool {
        if let Some(max_attempts) = self.max_attempts {
            if attempts >= max_attempts {
                return true;
            }
        }

        match self.max_elapsed {
            Some(max_elapsed) => elapsed >= max_elapsed,
            None => false,
        }
    }

    /// Time left in the budget, `None` for an unbounded policy.
    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        self.max_elapsed
            .map(|max_elapsed| max_elapsed.saturating_sub(elapsed))
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.max_elapsed == Some(Duration::ZERO) {
            return Err(HarnessError::InvalidPolicy(
                "max_elapsed must be > 0, use an unbounded policy instead".to_string(),
            ));
        }

        if self.max_attempts == Some(0) {
            return Err(HarnessError::InvalidPolicy(
                "max_attempts must be >= 1".to_string(),
            ));
        }

        if let WaitStrategy::Exponential { base, ceiling } = &self.wait {
            if ceiling < base {
                return Err(HarnessError::InvalidPolicy(
                    "exponential ceiling must be >= base".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Constant,
    Exponential,
}

/// Serializable form of a [`BackoffPolicy`], durations in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    #[serde(default = "default_interval")]
    pub interval: f64,
    #[serde(default = "default_ceiling")]
    pub ceiling: f64,
    /// `None` means unbounded.
    pub max_elapsed: Option<f64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub jitter: bool,
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Constant
}

fn default_interval() -> f64 {
    1.0
}

fn default_ceiling() -> f64 {
    30.0
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Constant,
            interval: default_interval(),
            ceiling: default_ceiling(),
            max_elapsed: Some(60.0),
            max_attempts: None,
            jitter: false,
        }
    }
}

impl PolicyConfig {
    pub fn to_policy(&self) -> Result<BackoffPolicy, HarnessError> {
        if self.interval < 0.0 || self.ceiling < 0.0 {
            return Err(HarnessError::InvalidPolicy(
                "delay values must be >= 0".to_string(),
            ));
        }

        let interval = Duration::from_secs_f64(self.interval);
        let wait = match self.strategy {
            StrategyKind::Constant => WaitStrategy::Constant { interval },
            StrategyKind::Exponential => WaitStrategy::Exponential {
                base: interval,
                ceiling: Duration::from_secs_f64(self.ceiling),
            },
        };

        let max_elapsed = match self.max_elapsed {
            Some(secs) if secs < 0.0 => {
                return Err(HarnessError::InvalidPolicy(
                    "max_elapsed must be >= 0".to_string(),
                ))
            }
            Some(secs) => Some(Duration::from_secs_f64(secs)),
            None => None,
        };

        let policy = BackoffPolicy {
            wait,
            max_elapsed,
            max_attempts: self.max_attempts,
            jitter: self.jitter,
        };
        policy.validate()?;
        Ok(policy)
    }
}
