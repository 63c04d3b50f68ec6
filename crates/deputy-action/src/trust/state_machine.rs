//! Trust level transitions and their guards.
//!
//! Levels move forward one step at a time, only when the account has met
//! the time and usage thresholds for the next level. The only ways down
//! are an explicit user downgrade and the emergency reset to the lowest
//! level.

use serde::Serialize;

use deputy_core::config::TrustConfig;
use deputy_core::trust::{TrustLevel, TrustState};
use deputy_core::types::Timestamp;

use crate::error::TrustError;

/// Whether an account may advance, and how far it is from doing so.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    pub current_level: TrustLevel,
    pub next_level: Option<TrustLevel>,
    pub eligible: bool,
    pub days_at_level: u32,
    pub required_days: u32,
    pub actions_at_level: u64,
    pub required_actions: u64,
}

impl Eligibility {
    /// Human-readable explanation of what is still missing.
    pub fn shortfall(&self) -> Option<String> {
        if self.eligible {
            return None;
        }
        if self.next_level.is_none() {
            return Some("already at the maximum level".to_string());
        }
        let mut missing = Vec::new();
        if self.days_at_level < self.required_days {
            missing.push(format!(
                "{} of {} days at current level",
                self.days_at_level, self.required_days
            ));
        }
        if self.actions_at_level < self.required_actions {
            missing.push(format!(
                "{} of {} executed actions",
                self.actions_at_level, self.required_actions
            ));
        }
        Some(missing.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustTransition {
    Advance(Eligibility),
    Downgrade(TrustLevel),
    EmergencyReset,
}

impl TrustTransition {
    pub fn reason(&self) -> &'static str {
        match self {
            TrustTransition::Advance(_) => "advance",
            TrustTransition::Downgrade(_) => "downgrade",
            TrustTransition::EmergencyReset => "emergency_pause",
        }
    }
}

/// Evaluate the upgrade thresholds for `state`.
pub fn eligibility(
    state: &TrustState,
    actions_at_level: u64,
    config: &TrustConfig,
    now: Timestamp,
) -> Eligibility {
    let days_at_level = state.level_entered_at.age_days(now);
    let next_level = state.level.next();
    let (required_days, required_actions) = match next_level {
        Some(next) => {
            let threshold = config.threshold_for(next);
            (
                threshold.min_days_at_previous_level,
                threshold.min_actions_at_previous_level,
            )
        }
        None => (0, 0),
    };

    Eligibility {
        current_level: state.level,
        next_level,
        eligible: next_level.is_some()
            && days_at_level >= required_days
            && actions_at_level >= required_actions,
        days_at_level,
        required_days,
        actions_at_level,
        required_actions,
    }
}

/// Guard a transition from `state`, returning the level it leads to.
pub fn apply(state: &TrustState, transition: &TrustTransition) -> Result<TrustLevel, TrustError> {
    match transition {
        TrustTransition::Advance(eligibility) => {
            let next = state
                .level
                .next()
                .ok_or_else(|| TrustError::AtMaximumLevel(state.account_id.clone()))?;
            if eligibility.current_level != state.level || !eligibility.eligible {
                return Err(TrustError::NotEligible {
                    account_id: state.account_id.clone(),
                    reason: eligibility
                        .shortfall()
                        .unwrap_or_else(|| "eligibility is stale".to_string()),
                });
            }
            Ok(next)
        }
        TrustTransition::Downgrade(target) => {
            if *target >= state.level {
                return Err(TrustError::InvalidLevel(format!(
                    "downgrade target {} is not below current level {}",
                    target, state.level
                )));
            }
            Ok(*target)
        }
        TrustTransition::EmergencyReset => Ok(TrustLevel::MIN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 86_400_000;

    fn state_at(level: TrustLevel, entered_days_ago: i64, now: Timestamp) -> TrustState {
        let mut state = TrustState::new("acct", Timestamp(now.0 - entered_days_ago * DAY_MS));
        state.level = level;
        state
    }

    #[test]
    fn test_eligible_after_threshold() {
        let now = Timestamp::now();
        let config = TrustConfig::default();
        // Level 2 requires 3 days at level 1 and no executed actions.
        let e = eligibility(&state_at(TrustLevel::Observe, 3, now), 0, &config, now);
        assert!(e.eligible);
        assert_eq!(e.next_level, Some(TrustLevel::Organize));
        assert!(e.shortfall().is_none());
    }

    #[test]
    fn test_not_eligible_when_entered_recently() {
        let now = Timestamp::now();
        let config = TrustConfig::default();
        let e = eligibility(&state_at(TrustLevel::Observe, 2, now), 0, &config, now);
        assert!(!e.eligible);
        assert_eq!(e.days_at_level, 2);
        assert!(e.shortfall().unwrap().contains("2 of 3 days"));
    }

    #[test]
    fn test_action_threshold() {
        let now = Timestamp::now();
        let config = TrustConfig::default();
        // Level 3 requires 7 days and 10 actions.
        let state = state_at(TrustLevel::Organize, 30, now);
        let short = eligibility(&state, 9, &config, now);
        assert!(!short.eligible);
        assert!(short.shortfall().unwrap().contains("9 of 10 executed actions"));
        assert!(eligibility(&state, 10, &config, now).eligible);
    }

    #[test]
    fn test_max_level_never_eligible() {
        let now = Timestamp::now();
        let e = eligibility(
            &state_at(TrustLevel::Act, 365, now),
            1000,
            &TrustConfig::default(),
            now,
        );
        assert!(!e.eligible);
        assert!(e.next_level.is_none());
    }

    #[test]
    fn test_advance_moves_one_step() {
        let now = Timestamp::now();
        let state = state_at(TrustLevel::Observe, 10, now);
        let e = eligibility(&state, 0, &TrustConfig::default(), now);
        assert_eq!(
            apply(&state, &TrustTransition::Advance(e)).unwrap(),
            TrustLevel::Organize
        );
    }

    #[test]
    fn test_advance_not_eligible() {
        let now = Timestamp::now();
        let state = state_at(TrustLevel::Observe, 0, now);
        let e = eligibility(&state, 0, &TrustConfig::default(), now);
        let err = apply(&state, &TrustTransition::Advance(e)).unwrap_err();
        assert!(matches!(err, TrustError::NotEligible { .. }));
    }

    #[test]
    fn test_advance_at_max() {
        let now = Timestamp::now();
        let state = state_at(TrustLevel::Act, 100, now);
        let e = eligibility(&state, 0, &TrustConfig::default(), now);
        assert!(matches!(
            apply(&state, &TrustTransition::Advance(e)),
            Err(TrustError::AtMaximumLevel(_))
        ));
    }

    #[test]
    fn test_advance_with_stale_eligibility() {
        let now = Timestamp::now();
        let old = state_at(TrustLevel::Observe, 10, now);
        let e = eligibility(&old, 0, &TrustConfig::default(), now);
        let moved = state_at(TrustLevel::Organize, 10, now);
        assert!(matches!(
            apply(&moved, &TrustTransition::Advance(e)),
            Err(TrustError::NotEligible { .. })
        ));
    }

    #[test]
    fn test_downgrade_must_lower() {
        let now = Timestamp::now();
        let state = state_at(TrustLevel::Schedule, 1, now);
        assert_eq!(
            apply(&state, &TrustTransition::Downgrade(TrustLevel::Organize)).unwrap(),
            TrustLevel::Organize
        );
        assert!(matches!(
            apply(&state, &TrustTransition::Downgrade(TrustLevel::Schedule)),
            Err(TrustError::InvalidLevel(_))
        ));
        assert!(matches!(
            apply(&state, &TrustTransition::Downgrade(TrustLevel::Act)),
            Err(TrustError::InvalidLevel(_))
        ));
    }

    #[test]
    fn test_emergency_reset_always_to_minimum() {
        let now = Timestamp::now();
        for level in TrustLevel::ALL {
            let state = state_at(level, 0, now);
            assert_eq!(
                apply(&state, &TrustTransition::EmergencyReset).unwrap(),
                TrustLevel::MIN
            );
        }
    }
}
