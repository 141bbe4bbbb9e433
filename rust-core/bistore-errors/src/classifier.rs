// SPDX-License-Identifier: PMPL-1.0-or-later
//! Classification of failures into a category, a severity and a recovery
//! strategy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::taxonomy::{Classify, ErrorCategory, ErrorSeverity};

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds).
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay (milliseconds).
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

/// What the recovery coordinator does about a classified failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    /// Retry the failed operation with exponential backoff.
    RetryWithBackoff(RetryPolicy),
    /// Re-establish connections, then retry with backoff.
    ReconnectWithBackoff(RetryPolicy),
    /// Release pressure on the exhausted resource and retry once it drains.
    ShedLoad(RetryPolicy),
    /// Surface the failure to the caller without any retry.
    FailFast,
    /// Stop touching the affected data and hand it to an operator.
    Quarantine,
}

impl RecoveryStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryStrategy::RetryWithBackoff(_) => "retry_with_backoff",
            RecoveryStrategy::ReconnectWithBackoff(_) => "reconnect_with_backoff",
            RecoveryStrategy::ShedLoad(_) => "shed_load",
            RecoveryStrategy::FailFast => "fail_fast",
            RecoveryStrategy::Quarantine => "quarantine",
        }
    }

    /// The retry schedule, if this strategy retries at all.
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        match self {
            RecoveryStrategy::RetryWithBackoff(p)
            | RecoveryStrategy::ReconnectWithBackoff(p)
            | RecoveryStrategy::ShedLoad(p) => Some(p),
            RecoveryStrategy::FailFast | RecoveryStrategy::Quarantine => None,
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tunables for the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Backoff for network failures.
    pub network_retry: RetryPolicy,
    /// Backoff between reconnect attempts for database failures.
    pub reconnect_retry: RetryPolicy,
    /// Backoff while waiting for exhausted resources to drain.
    pub shed_load_retry: RetryPolicy,
    /// Per-category severity floor; a classified error is never reported
    /// below this severity.
    pub severity_floor: HashMap<ErrorCategory, ErrorSeverity>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            network_retry: RetryPolicy::default(),
            reconnect_retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 100,
                max_backoff_ms: 5_000,
                multiplier: 2.0,
            },
            shed_load_retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 25,
                max_backoff_ms: 500,
                multiplier: 2.0,
            },
            severity_floor: HashMap::new(),
        }
    }
}

/// The result of classifying one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub strategy: RecoveryStrategy,
}

impl Classification {
    /// Whether the failure should be retried locally rather than surfaced.
    pub fn is_retryable(&self) -> bool {
        self.severity < ErrorSeverity::Catastrophic && self.strategy.retry_policy().is_some()
    }
}

/// Maps errors to categories, severities and recovery strategies.
///
/// Stateless apart from its configuration: the same error and configuration
/// always produce the same classification.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    config: ClassifierConfig,
}

impl ErrorClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify an error.
    pub fn classify(&self, error: &dyn Classify) -> Classification {
        let category = error.category();
        let mut severity = error.severity();
        if let Some(floor) = self.config.severity_floor.get(&category) {
            severity = severity.max(*floor);
        }
        Classification {
            category,
            severity,
            strategy: self.strategy_for(category),
        }
    }

    /// The recovery strategy configured for a category.
    pub fn strategy_for(&self, category: ErrorCategory) -> RecoveryStrategy {
        match category {
            ErrorCategory::NetworkFailure | ErrorCategory::ServiceUnavailable => {
                RecoveryStrategy::RetryWithBackoff(self.config.network_retry.clone())
            }
            ErrorCategory::DatabaseFailure => {
                RecoveryStrategy::ReconnectWithBackoff(self.config.reconnect_retry.clone())
            }
            ErrorCategory::ResourceExhaustion => {
                RecoveryStrategy::ShedLoad(self.config.shed_load_retry.clone())
            }
            ErrorCategory::ValidationFailure
            | ErrorCategory::ConfigurationError
            | ErrorCategory::AuthenticationFailure
            | ErrorCategory::SystemFailure => RecoveryStrategy::FailFast,
            ErrorCategory::DataCorruption | ErrorCategory::IntegrityViolation => {
                RecoveryStrategy::Quarantine
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("synthetic: {0}")]
    struct Synthetic(ErrorCategory);

    impl Classify for Synthetic {
        fn category(&self) -> ErrorCategory {
            self.0
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(50));
        assert_eq!(policy.backoff_for(30), Duration::from_millis(50));
    }

    #[test]
    fn test_strategy_by_category() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify(&Synthetic(ErrorCategory::DatabaseFailure)).strategy.name(),
            "reconnect_with_backoff"
        );
        assert_eq!(
            classifier.classify(&Synthetic(ErrorCategory::NetworkFailure)).strategy.name(),
            "retry_with_backoff"
        );
        assert_eq!(
            classifier.classify(&Synthetic(ErrorCategory::ResourceExhaustion)).strategy.name(),
            "shed_load"
        );
        assert_eq!(
            classifier.classify(&Synthetic(ErrorCategory::ValidationFailure)).strategy,
            RecoveryStrategy::FailFast
        );
        assert_eq!(
            classifier.classify(&Synthetic(ErrorCategory::DataCorruption)).strategy,
            RecoveryStrategy::Quarantine
        );
    }

    #[test]
    fn test_structural_errors_not_retryable() {
        let classifier = ErrorClassifier::default();
        for category in ErrorCategory::ALL {
            let c = classifier.classify(&Synthetic(category));
            if category.is_structural() {
                assert!(!c.is_retryable(), "{category} must not be retried");
            }
            if category.is_transient() {
                assert!(c.is_retryable(), "{category} should be retried");
            }
        }
    }

    #[test]
    fn test_severity_floor_applied() {
        let mut config = ClassifierConfig::default();
        config
            .severity_floor
            .insert(ErrorCategory::NetworkFailure, ErrorSeverity::Critical);
        let classifier = ErrorClassifier::new(config);
        let c = classifier.classify(&Synthetic(ErrorCategory::NetworkFailure));
        assert_eq!(c.severity, ErrorSeverity::Critical);
    }
}
