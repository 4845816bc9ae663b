//! Domain identifiers.
//!
//! # TaskId
//! 送信側が付けた id はそのまま保持する（相関とリトライ追跡に使うため、
//! 形式は問わない）。id が無い場合だけ ULID から生成する。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: timestamp が先頭にあるため、生成順序でソートできる
//! - **分散生成可能**: ノード間の調整なしで生成できる

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

use crate::ports::Clock;

/// Identifier of a task, stable across retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// 送信側が指定した id をそのまま使う
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// 現在時刻から ULID ベースの id を生成
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    /// Clock の時刻で ULID を生成（テストで時刻を固定したいとき用）
    pub fn generate_with<C: Clock + ?Sized>(clock: &C) -> Self {
        let millis = clock.now().timestamp_millis().max(0) as u64;
        Self::from_ulid(Ulid::from_parts(millis, rand::random()))
    }

    fn from_ulid(ulid: Ulid) -> Self {
        Self(format!("task-{ulid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn sender_ids_are_kept_verbatim() {
        let id = TaskId::new("t1");
        assert_eq!(id.as_str(), "t1");
        assert_eq!(id.to_string(), "t1");
    }

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = TaskId::generate();
        let b = TaskId::generate();

        assert!(a.as_str().starts_with("task-"));
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_sort_by_clock_time() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let earlier = TaskId::generate_with(&clock);
        clock.advance(chrono::Duration::seconds(1));
        let later = TaskId::generate_with(&clock);

        assert!(earlier < later);
    }

    #[test]
    fn task_ids_serialize_as_plain_strings() {
        let id = TaskId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
