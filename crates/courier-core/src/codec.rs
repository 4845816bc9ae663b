//! Envelope codec - Task / OutcomeReport と wire bytes の相互変換
//!
//! # Wire format
//! ```text
//! [version: u8][kind: u8][bincode body]
//! ```
//! - version: 現在は `FORMAT_VERSION`。それより新しいものは `UnsupportedVersion`
//! - kind: 1 = task, 2 = outcome
//! - body: bincode（varint, サイズ上限付き, 末尾の余分なバイトは拒否）
//!
//! transport に依存しない。グローバル状態も持たない。

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::domain::{OutcomeReport, Task};

/// Newest envelope version this build understands.
pub const FORMAT_VERSION: u8 = 1;

/// Upper bound on a decoded body.
pub const MAX_ENVELOPE_BYTES: u64 = 16 * 1024 * 1024;

const KIND_TASK: u8 = 1;
const KIND_OUTCOME: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unsupported envelope version {found} (newest supported is {supported})")]
    UnsupportedVersion { found: u8, supported: u8 },

    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_ENVELOPE_BYTES)
}

pub fn encode_task(task: &Task) -> Result<Vec<u8>, CodecError> {
    encode(KIND_TASK, task)
}

pub fn encode_outcome(report: &OutcomeReport) -> Result<Vec<u8>, CodecError> {
    encode(KIND_OUTCOME, report)
}

/// Decodes a task envelope. An empty id is accepted; the receiver assigns one.
pub fn decode_task(bytes: &[u8]) -> Result<Task, CodecError> {
    let task: Task = decode(KIND_TASK, bytes)?;
    if task.task_type().is_empty() {
        return Err(CodecError::MalformedEnvelope("task type is empty".into()));
    }
    task.metadata().validate().map_err(CodecError::MalformedEnvelope)?;
    Ok(task)
}

pub fn decode_outcome(bytes: &[u8]) -> Result<OutcomeReport, CodecError> {
    let report: OutcomeReport = decode(KIND_OUTCOME, bytes)?;
    if report.task_id.is_empty() {
        return Err(CodecError::MalformedEnvelope("outcome task id is empty".into()));
    }
    report.validate().map_err(CodecError::MalformedEnvelope)?;
    report.metadata.validate().map_err(CodecError::MalformedEnvelope)?;
    Ok(report)
}

fn encode<T: Serialize>(kind: u8, body: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![FORMAT_VERSION, kind];
    options()
        .serialize_into(&mut buf, body)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(expected_kind: u8, bytes: &[u8]) -> Result<T, CodecError> {
    let body = match bytes {
        [] => return Err(CodecError::MalformedEnvelope("empty buffer".into())),
        [0, ..] => return Err(CodecError::MalformedEnvelope("version 0 is not valid".into())),
        [version, ..] if *version > FORMAT_VERSION => {
            return Err(CodecError::UnsupportedVersion {
                found: *version,
                supported: FORMAT_VERSION,
            });
        }
        [_] => return Err(CodecError::MalformedEnvelope("truncated header".into())),
        [_, kind, body @ ..] => {
            if *kind != expected_kind {
                return Err(CodecError::MalformedEnvelope(format!(
                    "expected envelope kind {expected_kind}, found {kind}"
                )));
            }
            body
        }
    };
    options()
        .deserialize(body)
        .map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MetaValue, Metadata, Outcome, TaskId};
    use chrono::DateTime;
    use proptest::prelude::*;
    use rstest::rstest;

    fn sample_task() -> Task {
        Task::new("t1", "echo", b"hello".to_vec()).with_metadata(
            Metadata::new()
                .with("x-first", "unknown keys survive")
                .with("retry-count", 2_i64)
                .with("x-blob", vec![0_u8, 255]),
        )
    }

    #[test]
    fn task_round_trip() {
        let task = sample_task();
        let decoded = decode_task(&encode_task(&task).unwrap()).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn outcome_round_trip() {
        let report = OutcomeReport::from_outcome(&sample_task(), &Outcome::failure("boom", true))
            .with_origin("node-1");
        let decoded = decode_outcome(&encode_outcome(&report).unwrap()).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn header_carries_version_and_kind() {
        let bytes = encode_task(&sample_task()).unwrap();
        assert_eq!(bytes[0], FORMAT_VERSION);
        assert_eq!(bytes[1], KIND_TASK);
    }

    #[test]
    fn newer_version_is_unsupported() {
        let mut bytes = encode_task(&sample_task()).unwrap();
        bytes[0] = FORMAT_VERSION + 1;
        assert_eq!(
            decode_task(&bytes),
            Err(CodecError::UnsupportedVersion {
                found: FORMAT_VERSION + 1,
                supported: FORMAT_VERSION
            })
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_task(&sample_task()).unwrap();
        bytes.push(0);
        assert!(matches!(decode_task(&bytes), Err(CodecError::MalformedEnvelope(_))));
    }

    #[test]
    fn outcome_bytes_are_not_a_task() {
        let report = OutcomeReport::from_outcome(&sample_task(), &Outcome::Timeout);
        let bytes = encode_outcome(&report).unwrap();
        assert!(matches!(decode_task(&bytes), Err(CodecError::MalformedEnvelope(_))));
    }

    #[test]
    fn task_without_id_decodes_with_empty_id() {
        let task = Task::new("", "echo", b"x".to_vec());
        let decoded = decode_task(&encode_task(&task).unwrap()).unwrap();
        assert!(decoded.id().is_empty());
    }

    #[rstest]
    #[case::empty_type(Task::new("t1", "", Vec::new()))]
    #[case::bad_retry_count(
        Task::new("t1", "echo", Vec::new()).with_metadata(Metadata::new().with("retry-count", "two"))
    )]
    #[case::oversized_retry_count(
        Task::new("t1", "echo", Vec::new())
            .with_metadata(Metadata::new().with("retry-count", i64::from(u32::MAX) + 1))
    )]
    fn invalid_tasks_are_malformed(#[case] task: Task) {
        let bytes = encode_task(&task).unwrap();
        assert!(matches!(decode_task(&bytes), Err(CodecError::MalformedEnvelope(_))));
    }

    fn meta_value() -> impl Strategy<Value = MetaValue> {
        prop_oneof![
            ".{0,12}".prop_map(MetaValue::Str),
            any::<i64>().prop_map(MetaValue::Int),
            any::<bool>().prop_map(MetaValue::Bool),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(MetaValue::Bytes),
        ]
    }

    prop_compose! {
        fn arb_task()(
            id in "[a-zA-Z0-9-]{1,24}",
            task_type in "[a-z][a-z._]{0,15}",
            payload in proptest::collection::vec(any::<u8>(), 0..128),
            entries in proptest::collection::vec(("x-[a-z]{1,8}", meta_value()), 0..6),
            retries in proptest::option::of(0_i64..50),
            received_ms in 0_i64..4_000_000_000_000,
        ) -> Task {
            let mut metadata: Metadata = entries.into_iter().collect();
            if let Some(n) = retries {
                metadata.insert("retry-count", n);
            }
            Task::new(TaskId::new(id), task_type, payload)
                .with_metadata(metadata)
                .with_received_at(DateTime::from_timestamp_millis(received_ms).unwrap())
        }
    }

    fn arb_outcome() -> impl Strategy<Value = Outcome> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Outcome::success),
            (".{0,32}", any::<bool>()).prop_map(|(e, r)| Outcome::failure(e, r)),
            Just(Outcome::Timeout),
        ]
    }

    proptest! {
        #[test]
        fn any_task_round_trips(task in arb_task()) {
            let bytes = encode_task(&task).unwrap();
            prop_assert_eq!(decode_task(&bytes).unwrap(), task);
        }

        #[test]
        fn any_outcome_round_trips(task in arb_task(), outcome in arb_outcome()) {
            let report = OutcomeReport::from_outcome(&task, &outcome);
            let bytes = encode_outcome(&report).unwrap();
            prop_assert_eq!(decode_outcome(&bytes).unwrap(), report);
        }

        #[test]
        fn truncated_tasks_are_malformed(task in arb_task(), cut in any::<prop::sample::Index>()) {
            let bytes = encode_task(&task).unwrap();
            let len = cut.index(bytes.len());
            let result = decode_task(&bytes[..len]);
            prop_assert!(matches!(result, Err(CodecError::MalformedEnvelope(_))));
        }

        #[test]
        fn random_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            match decode_task(&bytes) {
                Ok(_) | Err(CodecError::MalformedEnvelope(_)) | Err(CodecError::UnsupportedVersion { .. }) => {}
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
            let _ = decode_outcome(&bytes);
        }
    }
}
