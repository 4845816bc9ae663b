//! Errors - 実行エラーと運用上の分類

use thiserror::Error;

/// ErrorKind はエラーの運用分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Routing: 宛先のモジュールが存在しない
/// - Infrastructure: broker 等の障害
/// - Fatal: プロセスを止めるべきエラー（起動時の設定・登録ミス、broker 喪失）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Routing,
    Infrastructure,
    Fatal,
}

/// Error returned by a module's `execute`.
///
/// 報告されていない場合、dispatcher はこれを `Outcome::Failure` に変換する。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    message: String,
    retryable: bool,
}

impl ExecutionError {
    /// A failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not succeed on retry.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn kind(&self) -> ErrorKind {
        if self.retryable {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}
