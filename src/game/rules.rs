//! Match Rules
//!
//! Tunables for a single match: round target, phase durations, power
//! meter and settlement retry policy. All durations are milliseconds on
//! the match clock.

use std::time::Duration;

use thiserror::Error;

/// Power is tracked in hundredths of a unit.
pub const POWER_SCALE: u32 = 100;

/// Rule validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RulesError {
    /// Round target must be at least one.
    #[error("round target must be at least 1")]
    ZeroRoundTarget,
    /// Power cap must be positive.
    #[error("max power must be positive")]
    ZeroPowerCap,
    /// A phase duration of zero would spin the match.
    #[error("duration for {0} must be positive")]
    ZeroDuration(&'static str),
}

/// Bounded exponential backoff for custody calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Ceiling on any single delay.
    pub max_delay_ms: u64,
    /// Attempts (including the first) before giving up.
    pub max_attempts: u32,
    /// Per-call timeout applied to the gateway.
    pub call_timeout_ms: u64,
    /// How long a submitted payout may wait for custody to confirm it.
    pub confirm_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 6,
            call_timeout_ms: 15_000,
            confirm_timeout_ms: 600_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1 = first retry).
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Gateway call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Rules for one match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRules {
    /// Best-of-N target. Should be odd; an even target can end tied and
    /// falls back to sudden death.
    pub round_target: u32,
    /// Time both stakes have to reach custody once the match is locked.
    pub deposit_window_ms: u64,
    /// Pre-game countdown.
    pub countdown_ms: u64,
    /// Per-round choice limit.
    pub choosing_ms: u64,
    /// Per-round charge limit.
    pub charging_ms: u64,
    /// Fixed part of the result display.
    pub result_base_ms: u64,
    /// Extra display time per unit of combined power.
    pub result_per_power_unit_ms: u64,
    /// Power cap in units.
    pub max_power_units: u32,
    /// Charge rate in units per second.
    pub charge_units_per_sec: u32,
    /// Interval between power updates while charging.
    pub power_tick_ms: u64,
    /// Consecutive turn timeouts that forfeit the match.
    pub abandon_after_timeouts: u32,
    /// Custody retry policy.
    pub settlement_retry: RetryPolicy,
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            round_target: 5,
            deposit_window_ms: 120_000,
            countdown_ms: 3_000,
            choosing_ms: 30_000,
            charging_ms: 15_000,
            result_base_ms: 2_500,
            result_per_power_unit_ms: 150,
            max_power_units: 10,
            charge_units_per_sec: 4,
            power_tick_ms: 100,
            abandon_after_timeouts: 3,
            settlement_retry: RetryPolicy::default(),
        }
    }
}

impl MatchRules {
    /// Create rules from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            round_target: env_or("FLIP_ROUND_TARGET", defaults.round_target),
            deposit_window_ms: env_secs_or("FLIP_DEPOSIT_WINDOW_SECS", defaults.deposit_window_ms),
            countdown_ms: env_secs_or("FLIP_COUNTDOWN_SECS", defaults.countdown_ms),
            choosing_ms: env_secs_or("FLIP_CHOOSING_SECS", defaults.choosing_ms),
            charging_ms: env_secs_or("FLIP_CHARGING_SECS", defaults.charging_ms),
            abandon_after_timeouts: env_or("FLIP_ABANDON_AFTER", defaults.abandon_after_timeouts),
            settlement_retry: RetryPolicy {
                max_attempts: env_or("FLIP_SETTLEMENT_MAX_ATTEMPTS", defaults.settlement_retry.max_attempts),
                ..defaults.settlement_retry
            },
            ..defaults
        }
    }

    /// Check the rules are playable.
    pub fn validate(&self) -> Result<(), RulesError> {
        if self.round_target == 0 {
            return Err(RulesError::ZeroRoundTarget);
        }
        if self.max_power_units == 0 {
            return Err(RulesError::ZeroPowerCap);
        }
        for (name, value) in [
            ("deposit window", self.deposit_window_ms),
            ("countdown", self.countdown_ms),
            ("choosing", self.choosing_ms),
            ("charging", self.charging_ms),
            ("power tick", self.power_tick_ms),
        ] {
            if value == 0 {
                return Err(RulesError::ZeroDuration(name));
            }
        }
        Ok(())
    }

    /// Power cap in scaled units.
    pub fn max_power(&self) -> u32 {
        self.max_power_units * POWER_SCALE
    }

    /// How long a result stays on screen for a given combined power.
    pub fn result_display_ms(&self, combined_power: u32) -> u64 {
        let extra = self.result_per_power_unit_ms.saturating_mul(combined_power as u64) / POWER_SCALE as u64;
        self.result_base_ms.saturating_add(extra)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs_or(key: &str, default_ms: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1_000))
        .unwrap_or(default_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_are_valid() {
        let rules = MatchRules::default();
        assert_eq!(rules.round_target, 5);
        assert_eq!(rules.max_power(), 1_000);
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let rules = MatchRules { round_target: 0, ..Default::default() };
        assert_eq!(rules.validate(), Err(RulesError::ZeroRoundTarget));

        let rules = MatchRules { choosing_ms: 0, ..Default::default() };
        assert_eq!(rules.validate(), Err(RulesError::ZeroDuration("choosing")));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 500,
            max_delay_ms: 3_000,
            max_attempts: 4,
            call_timeout_ms: 1_000,
            confirm_timeout_ms: 10_000,
        };
        assert_eq!(policy.delay_for(1), 500);
        assert_eq!(policy.delay_for(2), 1_000);
        assert_eq!(policy.delay_for(3), 2_000);
        assert_eq!(policy.delay_for(4), 3_000);
        assert_eq!(policy.delay_for(40), 3_000);
        assert!(policy.can_retry(3));
        assert!(!policy.can_retry(4));
    }

    #[test]
    fn test_env_seconds_saturate() {
        std::env::set_var("FLIP_TEST_HUGE_SECS", u64::MAX.to_string());
        assert_eq!(env_secs_or("FLIP_TEST_HUGE_SECS", 7), u64::MAX);
        std::env::set_var("FLIP_TEST_HUGE_SECS", "3");
        assert_eq!(env_secs_or("FLIP_TEST_HUGE_SECS", 7), 3_000);
        std::env::remove_var("FLIP_TEST_HUGE_SECS");
        assert_eq!(env_secs_or("FLIP_TEST_HUGE_SECS", 7), 7);
    }

    #[test]
    fn test_result_display_grows_with_power() {
        let rules = MatchRules::default();
        assert_eq!(rules.result_display_ms(0), 2_500);
        assert_eq!(rules.result_display_ms(1_000), 2_500 + 1_500);
    }
}
