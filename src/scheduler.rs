use std::time::Duration;

use crate::error::PipelineError;
use crate::recipe::RetrySpec;

/// Uniform per-step retry policy: a failed step is re-run up to `retries`
/// more times, waiting `delay` before each new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_spec(&RetrySpec::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp { reason: GiveUpReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    Exhausted,
    NotRetryable,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    pub fn from_spec(spec: &RetrySpec) -> Self {
        Self::new(spec.retries, spec.delay())
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// What to do after the 1-based `attempt` failed with `err`.
    pub fn decide(&self, attempt: u32, err: &PipelineError) -> RetryDecision {
        if !err.is_retryable() {
            RetryDecision::GiveUp {
                reason: GiveUpReason::NotRetryable,
            }
        } else if attempt >= self.max_attempts() {
            RetryDecision::GiveUp {
                reason: GiveUpReason::Exhausted,
            }
        } else {
            RetryDecision::Retry { delay: self.delay }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_exhausted() {
        let policy = RetryPolicy::new(2, Duration::from_secs(120));
        let err = PipelineError::Fit("single class".into());
        assert_eq!(
            policy.decide(1, &err),
            RetryDecision::Retry {
                delay: Duration::from_secs(120)
            }
        );
        assert!(matches!(policy.decide(2, &err), RetryDecision::Retry { .. }));
        assert_eq!(
            policy.decide(3, &err),
            RetryDecision::GiveUp {
                reason: GiveUpReason::Exhausted
            }
        );
    }

    #[test]
    fn consistency_errors_are_never_retried() {
        let policy = RetryPolicy::default();
        let err = PipelineError::Consistency("column mismatch".into());
        assert_eq!(
            policy.decide(1, &err),
            RetryDecision::GiveUp {
                reason: GiveUpReason::NotRetryable
            }
        );
    }
}
