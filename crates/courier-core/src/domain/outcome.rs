//! Outcome model: what a module execution produced.
//!
//! `Outcome` は実行結果そのもの、`OutcomeReport` は result/error sink に
//! publish される wire 上の形。

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::metadata::{Metadata, keys};
use super::task::{Task, TaskType};

/// Classification of an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    Failure,
    Timeout,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Failure => "failure",
            OutcomeStatus::Timeout => "timeout",
        }
    }
}

/// The result of executing one task. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { result: Vec<u8> },
    Failure { error: String, retryable: bool },
    Timeout,
}

impl Outcome {
    pub fn success(result: impl Into<Vec<u8>>) -> Self {
        Outcome::Success {
            result: result.into(),
        }
    }

    pub fn failure(error: impl Into<String>, retryable: bool) -> Self {
        Outcome::Failure {
            error: error.into(),
            retryable,
        }
    }

    pub fn status(&self) -> OutcomeStatus {
        match self {
            Outcome::Success { .. } => OutcomeStatus::Success,
            Outcome::Failure { .. } => OutcomeStatus::Failure,
            Outcome::Timeout => OutcomeStatus::Timeout,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Timeout は常にリトライ可能として扱う
    pub fn is_retryable(&self) -> bool {
        match self {
            Outcome::Success { .. } => false,
            Outcome::Failure { retryable, .. } => *retryable,
            Outcome::Timeout => true,
        }
    }
}

/// Outcome as published to the result or error topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub status: OutcomeStatus,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub retryable: bool,
    pub retry_count: u32,
    pub metadata: Metadata,
}

impl OutcomeReport {
    /// Builds the report for `outcome`. Task metadata is carried over so
    /// correlation keys reach the consumer.
    pub fn from_outcome(task: &Task, outcome: &Outcome) -> Self {
        let (result, error, retryable) = match outcome {
            Outcome::Success { result } => (Some(result.clone()), None, false),
            Outcome::Failure { error, retryable } => (None, Some(error.clone()), *retryable),
            Outcome::Timeout => (None, Some("task timed out".to_string()), true),
        };
        Self {
            task_id: task.id().clone(),
            task_type: task.task_type().clone(),
            status: outcome.status(),
            result,
            error,
            retryable,
            retry_count: task.retry_count(),
            metadata: task.metadata().clone(),
        }
    }

    pub fn with_origin(mut self, node: &str) -> Self {
        self.metadata.insert(keys::ORIGIN, node);
        self
    }

    /// Status と result/error の組み合わせが正しいか
    pub fn validate(&self) -> Result<(), String> {
        match (self.status, &self.result, &self.error) {
            (OutcomeStatus::Success, Some(_), None) => Ok(()),
            (OutcomeStatus::Failure | OutcomeStatus::Timeout, None, Some(_)) => Ok(()),
            (status, result, error) => Err(format!(
                "{} outcome with result present = {}, error present = {}",
                status.as_str(),
                result.is_some(),
                error.is_some()
            )),
        }
    }

    /// Rebuilds the in-process outcome.
    pub fn outcome(&self) -> Outcome {
        match self.status {
            OutcomeStatus::Success => Outcome::success(self.result.clone().unwrap_or_default()),
            OutcomeStatus::Failure => {
                Outcome::failure(self.error.clone().unwrap_or_default(), self.retryable)
            }
            OutcomeStatus::Timeout => Outcome::Timeout,
        }
    }
}
