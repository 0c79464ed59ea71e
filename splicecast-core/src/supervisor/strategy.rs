use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::SupervisorSection;
use crate::error::{ConfigError, Result};

/// Decides whether, and after how long, a failed chain is respawned.
pub trait RestartStrategy: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Delay before restart number `attempt` (1-based). `None` vetoes it.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

#[derive(Debug, Clone)]
pub struct Immediate {
    pub max_restarts: u32,
}

impl RestartStrategy for Immediate {
    fn name(&self) -> &'static str {
        "immediate"
    }

    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt <= self.max_restarts).then_some(Duration::ZERO)
    }
}

/// Capped exponential backoff: `initial * 2^(attempt - 1)`, clamped to `max`,
/// plus up to `jitter` of random delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_restarts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Backoff {
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl RestartStrategy for Backoff {
    fn name(&self) -> &'static str {
        "backoff"
    }

    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_restarts {
            return None;
        }
        let mut delay = self.base_delay(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms > 0 {
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        }
        Some(delay)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Never;

impl RestartStrategy for Never {
    fn name(&self) -> &'static str {
        "never"
    }

    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

pub const STRATEGY_NAMES: [&str; 3] = ["immediate", "backoff", "never"];

/// Builds a strategy by (case-insensitive) name with limits from `section`.
pub fn strategy_from_name(
    name: &str,
    section: &SupervisorSection,
) -> Result<Arc<dyn RestartStrategy>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "immediate" => Ok(Arc::new(Immediate {
            max_restarts: section.max_restarts,
        })),
        "backoff" => Ok(Arc::new(Backoff {
            max_restarts: section.max_restarts,
            initial: Duration::from_millis(section.backoff_initial_ms),
            max: Duration::from_millis(section.backoff_max_ms.max(section.backoff_initial_ms)),
            jitter: Duration::from_millis(section.backoff_jitter_ms),
        })),
        "never" => Ok(Arc::new(Never)),
        _ => Err(ConfigError::UnknownStrategy(name.to_string())),
    }
}
