//! Retry decisions shared by every component that tries something twice.
//!
//! [`RetryPolicy`] is pure configuration: it never sleeps and never counts.
//! Callers own the attempt counter and ask the policy before each retry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorClass;

/// Transient service errors get a fixed allowance independent of configuration.
pub const MAX_TRANSIENT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries per stage invocation after an execution or validation failure.
    pub max_agent_retries: u32,
    /// Ceiling for the audit correction loop.
    pub max_audit_retries: u32,
    /// Delay before the first retry; doubles every attempt.
    pub base_delay: Duration,
    /// Upper bound for any single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_agent_retries: 1,
            max_audit_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries with the same budgets but never waits.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Same policy with a different audit ceiling.
    pub fn with_audit_ceiling(&self, ceiling: u32) -> Self {
        Self {
            max_audit_retries: ceiling,
            ..self.clone()
        }
    }

    /// Whether a failure of `class` should be tried again, given that
    /// `attempt` retries have already been spent.
    pub fn should_retry(&self, class: ErrorClass, attempt: u32) -> bool {
        match class {
            ErrorClass::Execution | ErrorClass::Validation => attempt < self.max_agent_retries,
            ErrorClass::Audit => attempt < self.max_audit_retries,
            ErrorClass::Transient => attempt < MAX_TRANSIENT_RETRIES,
            ErrorClass::Permanent => false,
        }
    }

    /// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budgets() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_agent_retries, 1);
        assert_eq!(policy.max_audit_retries, 2);
    }

    #[test]
    fn execution_and_validation_share_the_agent_budget() {
        let policy = RetryPolicy::default();
        for class in [ErrorClass::Execution, ErrorClass::Validation] {
            assert!(policy.should_retry(class, 0));
            assert!(!policy.should_retry(class, 1));
        }
    }

    #[test]
    fn audit_uses_its_own_ceiling() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(ErrorClass::Audit, 1));
        assert!(!policy.should_retry(ErrorClass::Audit, 2));

        let strict = policy.with_audit_ceiling(0);
        assert!(!strict.should_retry(ErrorClass::Audit, 0));
    }

    #[test]
    fn transient_errors_get_three_retries() {
        let policy = RetryPolicy {
            max_agent_retries: 0,
            ..RetryPolicy::default()
        };
        assert!(policy.should_retry(ErrorClass::Transient, 2));
        assert!(!policy.should_retry(ErrorClass::Transient, 3));
    }

    #[test]
    fn permanent_errors_never_retry() {
        assert!(!RetryPolicy::default().should_retry(ErrorClass::Permanent, 0));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(64), Duration::from_secs(30));
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.backoff_delay(4), Duration::ZERO);
        assert_eq!(policy.max_agent_retries, 1);
    }
}
