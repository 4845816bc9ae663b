//! Decision model: what to do with a task once its outcome is known.
//!
//! Decider は純粋関数。副作用（republish, ack）は dispatcher が実行する。

use std::time::Duration;

use super::outcome::Outcome;
use super::retry::RetryPolicy;
use super::task::Task;
use crate::module::Capabilities;

/// The next action for a task whose execution finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Publish the success outcome (if a sink is declared) and ack.
    Complete,

    /// Republish to the input queue with `retry_count` after `delay`, then ack.
    Retry {
        delay: Duration,
        retry_count: u32,
        reason: String,
    },

    /// Publish a failure outcome to the error sink and ack.
    GiveUp { reason: String },
}

/// Trait for deciding the next action based on the task and its outcome.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &Task, capabilities: Capabilities, outcome: &Outcome) -> Decision;
}

/// Retry-count based decider with exponential backoff.
///
/// - Success → Complete
/// - Non-retryable failure, or a module without the `retryable` capability → GiveUp
/// - Retryable failure / timeout with retry-count < max_retries → Retry
/// - Otherwise → GiveUp (retries exhausted)
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
    max_retries: u32,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy, max_retries: u32) -> Self {
        Self {
            retry_policy,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), 3)
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, capabilities: Capabilities, outcome: &Outcome) -> Decision {
        if outcome.is_success() {
            return Decision::Complete;
        }
        if !outcome.is_retryable() {
            return Decision::GiveUp {
                reason: "permanent failure".to_string(),
            };
        }
        if !capabilities.retryable {
            return Decision::GiveUp {
                reason: format!("module `{}` is not retryable", task.task_type()),
            };
        }

        let attempts = task.retry_count();
        if attempts >= self.max_retries {
            return Decision::GiveUp {
                reason: format!("retries exhausted: {attempts}/{}", self.max_retries),
            };
        }

        let retry_count = attempts + 1;
        let delay = self.retry_policy.next_delay(retry_count);
        Decision::Retry {
            delay,
            retry_count,
            reason: format!("retry {retry_count}/{} after {delay:?}", self.max_retries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decider() -> DefaultDecider {
        DefaultDecider::new(
            RetryPolicy::new(Duration::from_secs(2), 2.0, Duration::from_secs(60)),
            3,
        )
    }

    fn task_with_retries(count: u32) -> Task {
        let mut task = Task::new("t1", "work", Vec::new());
        task.metadata_mut().set_retry_count(count);
        task
    }

    #[test]
    fn success_completes() {
        let decision = decider().decide(
            &task_with_retries(0),
            Capabilities::default(),
            &Outcome::success(Vec::new()),
        );
        assert_eq!(decision, Decision::Complete);
    }

    #[rstest]
    #[case::first_failure(0, 1, 2)]
    #[case::second_failure(1, 2, 4)]
    #[case::last_allowed(2, 3, 8)]
    fn retryable_failures_are_retried_with_backoff(
        #[case] attempts: u32,
        #[case] expected_count: u32,
        #[case] expected_secs: u64,
    ) {
        let decision = decider().decide(
            &task_with_retries(attempts),
            Capabilities::default(),
            &Outcome::failure("flaky", true),
        );

        match decision {
            Decision::Retry {
                delay, retry_count, ..
            } => {
                assert_eq!(retry_count, expected_count);
                assert_eq!(delay, Duration::from_secs(expected_secs));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_retries_give_up() {
        let decision = decider().decide(
            &task_with_retries(3),
            Capabilities::default(),
            &Outcome::failure("flaky", true),
        );
        assert!(matches!(decision, Decision::GiveUp { .. }));
    }

    #[test]
    fn timeouts_are_retried() {
        let decision = decider().decide(&task_with_retries(0), Capabilities::default(), &Outcome::Timeout);
        assert!(matches!(decision, Decision::Retry { retry_count: 1, .. }));
    }

    #[rstest]
    #[case::permanent_failure(Capabilities::default(), Outcome::failure("bad input", false))]
    #[case::module_not_retryable(Capabilities::default().non_retryable(), Outcome::failure("flaky", true))]
    #[case::timeout_on_non_retryable_module(Capabilities::default().non_retryable(), Outcome::Timeout)]
    fn no_retry_without_permission(#[case] capabilities: Capabilities, #[case] outcome: Outcome) {
        let decision = decider().decide(&task_with_retries(0), capabilities, &outcome);
        assert!(matches!(decision, Decision::GiveUp { .. }));
    }
}
