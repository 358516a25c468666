//! Self-healing budget: a global attempt counter plus a wall-clock window.
//!
//! Every heal tier consumes from the same budget before acting; the budget is
//! never restored within a run.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct HealPolicy {
    pub enabled: bool,
    pub max_auto_heal_attempts: u32,
    /// Transient (throttle/conflict) retries allowed per failure.
    pub transient_retries: u32,
    /// Wall-clock window for all healing in a run.
    pub max_window: Duration,
}

impl Default for HealPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_auto_heal_attempts: 4,
            transient_retries: 2,
            max_window: Duration::from_secs(8 * 60),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum HealExhausted {
    #[error("healing disabled by policy")]
    Disabled,
    #[error("healing budget exhausted ({attempts} attempts)")]
    Attempts { attempts: u32 },
    #[error("healing window exhausted ({elapsed_secs}s elapsed)")]
    Window { elapsed_secs: u64 },
}

#[derive(Debug, Clone)]
pub struct HealState {
    started_at: Instant,
    attempts: u32,
}

impl Default for HealState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Consume one heal attempt. Decrements before the attempt runs; a failed
    /// attempt is still spent.
    pub fn try_consume(&mut self, policy: &HealPolicy) -> Result<(), HealExhausted> {
        if !policy.enabled {
            return Err(HealExhausted::Disabled);
        }
        if self.attempts >= policy.max_auto_heal_attempts {
            return Err(HealExhausted::Attempts {
                attempts: self.attempts,
            });
        }
        let elapsed = self.started_at.elapsed();
        if elapsed > policy.max_window {
            return Err(HealExhausted::Window {
                elapsed_secs: elapsed.as_secs(),
            });
        }
        self.attempts += 1;
        Ok(())
    }

    #[cfg(test)]
    pub fn with_started_at(started_at: Instant) -> Self {
        Self {
            started_at,
            attempts: 0,
        }
    }
}
