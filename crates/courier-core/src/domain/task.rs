//! Task: the unit of work received from the broker.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use super::ids::TaskId;
use super::metadata::Metadata;

/// Name of the module a task is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// HashMap<TaskType, _> を &str で引けるようにする
impl Borrow<str> for TaskType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A decoded task request.
///
/// `id` は一度付与されたら変わらない。リトライ時も同じ id で再送出される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    task_type: TaskType,
    payload: Vec<u8>,
    metadata: Metadata,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    received_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, task_type: impl Into<TaskType>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            received_at: now_millis(),
        }
    }

    /// Creates a task with a generated id.
    pub fn generated(task_type: impl Into<TaskType>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(TaskId::generate(), task_type, payload)
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at.trunc_subsecs(3);
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata.retry_count()
    }

    /// id が空なら `id` を付与する。付与したら true
    pub(crate) fn assign_id_if_missing(&mut self, id: impl FnOnce() -> TaskId) -> bool {
        if !self.id.is_empty() {
            return false;
        }
        self.id = id();
        true
    }

    /// 受信時刻を打ち直す（connector が取り込み時に呼ぶ）
    pub(crate) fn stamp_received(&mut self, at: DateTime<Utc>) {
        self.received_at = at.trunc_subsecs(3);
    }

    /// The copy that goes back to the input queue on retry: same id, retry-count + 1.
    pub fn retried(&self) -> Task {
        let mut next = self.clone();
        next.metadata.set_retry_count(self.retry_count().saturating_add(1));
        next
    }
}

/// 現在時刻をミリ秒精度に丸める（wire 形式がミリ秒のため）
pub(crate) fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::metadata::keys;

    #[test]
    fn received_at_has_millisecond_precision() {
        let task = Task::new("t1", "echo", b"hi".to_vec());
        assert_eq!(task.received_at().timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn retried_copy_keeps_id_and_bumps_retry_count() {
        let task = Task::new("t1", "echo", b"x".to_vec())
            .with_metadata(Metadata::new().with("x-custom", "kept"));

        let first = task.retried();
        let second = first.retried();

        assert_eq!(first.id(), task.id());
        assert_eq!(first.retry_count(), 1);
        assert_eq!(second.retry_count(), 2);
        assert_eq!(second.metadata().get("x-custom"), task.metadata().get("x-custom"));
        assert!(second.metadata().get(keys::RETRY_COUNT).is_some());
    }

    #[test]
    fn missing_id_is_assigned_once() {
        let mut task = Task::new("", "echo", Vec::new());
        assert!(task.assign_id_if_missing(|| TaskId::new("task-a")));
        assert!(!task.assign_id_if_missing(|| TaskId::new("task-b")));
        assert_eq!(task.id().as_str(), "task-a");

        let mut named = Task::new("t1", "echo", Vec::new());
        assert!(!named.assign_id_if_missing(|| TaskId::new("task-c")));
        assert_eq!(named.id().as_str(), "t1");
    }

    #[test]
    fn generated_tasks_get_distinct_ids() {
        let a = Task::generated("echo", Vec::new());
        let b = Task::generated("echo", Vec::new());
        assert_ne!(a.id(), b.id());
    }
}
