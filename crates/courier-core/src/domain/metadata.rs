//! Task metadata: an ordered key → value list.
//!
//! 順序は受信時のまま保持し、未知のキーもそのまま再送出する。
//! よく使うキーは [`keys`] に定義し、型付きアクセサを提供する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known metadata keys.
pub mod keys {
    pub const PRIORITY: &str = "priority";
    /// Number of times the task has already been retried.
    pub const RETRY_COUNT: &str = "retry-count";
    /// Node that produced the message.
    pub const ORIGIN: &str = "origin";
    /// Absolute deadline as unix milliseconds.
    pub const DEADLINE: &str = "deadline";
    /// Topic the success outcome should be published to.
    pub const REPLY_TO: &str = "reply-to";
}

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MetaValue::Str(_) => "string",
            MetaValue::Int(_) => "integer",
            MetaValue::Bool(_) => "boolean",
            MetaValue::Bytes(_) => "bytes",
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<Vec<u8>> for MetaValue {
    fn from(value: Vec<u8>) -> Self {
        MetaValue::Bytes(value)
    }
}

/// Ordered metadata attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: Vec<(String, MetaValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// Sets `key`. An existing entry keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Option<MetaValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(name, _)| *name == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        let index = self.entries.iter().position(|(name, _)| name == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 0 when absent.
    pub fn retry_count(&self) -> u32 {
        self.get(keys::RETRY_COUNT)
            .and_then(MetaValue::as_int)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.insert(keys::RETRY_COUNT, i64::from(count));
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.get(keys::DEADLINE)
            .and_then(MetaValue::as_int)
            .and_then(DateTime::from_timestamp_millis)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.get(keys::REPLY_TO).and_then(MetaValue::as_str)
    }

    pub fn priority(&self) -> Option<i64> {
        self.get(keys::PRIORITY).and_then(MetaValue::as_int)
    }

    pub fn origin(&self) -> Option<&str> {
        self.get(keys::ORIGIN).and_then(MetaValue::as_str)
    }

    /// Checks the value types of the well-known keys.
    pub fn validate(&self) -> Result<(), String> {
        for (key, value) in self.iter() {
            let ok = match key {
                keys::RETRY_COUNT => matches!(value, MetaValue::Int(n) if u32::try_from(*n).is_ok()),
                keys::PRIORITY | keys::DEADLINE => matches!(value, MetaValue::Int(_)),
                keys::ORIGIN | keys::REPLY_TO => matches!(value, MetaValue::Str(_)),
                _ => true,
            };
            if !ok {
                return Err(format!(
                    "metadata `{key}` has unexpected {} value",
                    value.type_name()
                ));
            }
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<MetaValue>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}
