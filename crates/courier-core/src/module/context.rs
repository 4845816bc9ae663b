//! TaskContext - 1 回の実行に渡されるオブジェクト
//!
//! # 学習ポイント
//! - oneshot channel による単発の結果報告
//! - 二重報告は無視してログに残す（最初の報告が勝つ）
//! - 協調的キャンセル（CancellationToken）

use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::domain::{ExecutionError, Metadata, Outcome, Task, TaskId, TaskType};

pub struct TaskContext {
    task: Task,
    cancel: CancellationToken,
    reporter: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl TaskContext {
    /// Returns the context and the receiving half of its report channel.
    pub fn new(task: Task, cancel: CancellationToken) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let ctx = Self {
            task,
            cancel,
            reporter: Mutex::new(Some(tx)),
        };
        (ctx, rx)
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn id(&self) -> &TaskId {
        self.task.id()
    }

    pub fn task_type(&self) -> &TaskType {
        self.task.task_type()
    }

    pub fn payload(&self) -> &[u8] {
        self.task.payload()
    }

    pub fn metadata(&self) -> &Metadata {
        self.task.metadata()
    }

    pub fn retry_count(&self) -> u32 {
        self.task.retry_count()
    }

    /// True once the dispatcher gave up on this execution (timeout).
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the execution is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Token for handing cancellation to sub-work.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Reports success. Returns false if an outcome was already reported.
    pub fn succeed(&self, result: impl Into<Vec<u8>>) -> bool {
        self.report(Outcome::success(result))
    }

    /// Reports failure. Returns false if an outcome was already reported.
    pub fn fail(&self, error: impl Into<String>, retryable: bool) -> bool {
        self.report(Outcome::failure(error, retryable))
    }

    pub fn has_reported(&self) -> bool {
        self.reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn report(&self, outcome: Outcome) -> bool {
        let sender = self
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    // timeout 後の報告。dispatcher はもう待っていない
                    tracing::debug!(task.id = %self.id(), "late outcome discarded");
                }
                true
            }
            None => {
                tracing::warn!(
                    task.id = %self.id(),
                    status = outcome.status().as_str(),
                    "outcome already reported; ignoring second report"
                );
                false
            }
        }
    }

    /// Converts the handler's return value into a report unless it already reported.
    pub(crate) fn finish(&self, result: Result<(), ExecutionError>) {
        if self.has_reported() {
            if let Err(e) = result {
                tracing::debug!(task.id = %self.id(), error = %e, "error returned after outcome was reported");
            }
            return;
        }
        let outcome = match result {
            Ok(()) => Outcome::success(Vec::new()),
            Err(e) => Outcome::failure(e.message(), e.is_retryable()),
        };
        self.report(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (TaskContext, oneshot::Receiver<Outcome>) {
        TaskContext::new(Task::new("t1", "echo", b"hi".to_vec()), CancellationToken::new())
    }

    #[tokio::test]
    async fn first_report_wins() {
        let (ctx, rx) = context();

        assert!(ctx.succeed(b"first".to_vec()));
        assert!(!ctx.fail("second", true));
        assert!(!ctx.succeed(b"third".to_vec()));

        assert_eq!(rx.await.unwrap(), Outcome::success(b"first".to_vec()));
    }

    #[tokio::test]
    async fn unreported_ok_becomes_empty_success() {
        let (ctx, rx) = context();
        ctx.finish(Ok(()));
        assert_eq!(rx.await.unwrap(), Outcome::success(Vec::new()));
    }

    #[tokio::test]
    async fn unreported_error_keeps_retryability() {
        let (ctx, rx) = context();
        ctx.finish(Err(ExecutionError::permanent("bad payload")));
        assert_eq!(rx.await.unwrap(), Outcome::failure("bad payload", false));
    }

    #[tokio::test]
    async fn error_after_report_does_not_override() {
        let (ctx, rx) = context();
        ctx.succeed(Vec::new());
        ctx.finish(Err(ExecutionError::transient("ignored")));
        assert_eq!(rx.await.unwrap(), Outcome::success(Vec::new()));
    }

    #[test]
    fn report_after_receiver_dropped_still_counts() {
        let (ctx, rx) = context();
        drop(rx);
        assert!(ctx.fail("late", true));
        assert!(ctx.has_reported());
    }

    #[test]
    fn cancellation_is_visible() {
        let token = CancellationToken::new();
        let (ctx, _rx) = TaskContext::new(Task::new("t1", "echo", Vec::new()), token.clone());

        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
