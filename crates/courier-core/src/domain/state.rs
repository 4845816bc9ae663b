//! TaskState - dispatch 中のタスクの状態
//!
//! # 状態遷移
//! ```text
//! Received → Resolving → Rejected
//!                      → Dispatched → Executing → Completed ─┐
//!                                 │             → Failed    ─┼→ Acked
//!                                 └────────────→ TimedOut  ─┘
//! ```
//! Dispatched → TimedOut は実行前に deadline を過ぎていた場合。

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Received,
    Resolving,
    Rejected,
    Dispatched,
    Executing,
    Completed,
    Failed,
    TimedOut,
    Acked,
}

impl TaskState {
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Received, Resolving)
                | (Resolving, Rejected | Dispatched)
                | (Dispatched, Executing | TimedOut)
                | (Executing, Completed | Failed | TimedOut)
                | (Completed | Failed | TimedOut, Acked)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Rejected | TaskState::Acked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Received => "received",
            TaskState::Resolving => "resolving",
            TaskState::Rejected => "rejected",
            TaskState::Dispatched => "dispatched",
            TaskState::Executing => "executing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::TimedOut => "timed_out",
            TaskState::Acked => "acked",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TaskState::*;
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::resolve(Received, Resolving)]
    #[case::reject(Resolving, Rejected)]
    #[case::dispatch(Resolving, Dispatched)]
    #[case::expired_before_start(Dispatched, TimedOut)]
    #[case::complete(Executing, Completed)]
    #[case::fail(Executing, Failed)]
    #[case::timeout(Executing, TimedOut)]
    #[case::ack_after_timeout(TimedOut, Acked)]
    fn allowed_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case::skip_resolution(Received, Dispatched)]
    #[case::rejected_is_final(Rejected, Acked)]
    #[case::acked_is_final(Acked, Executing)]
    #[case::no_ack_while_running(Executing, Acked)]
    #[case::rejected_never_runs(Rejected, Executing)]
    fn forbidden_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn terminal_states() {
        assert!(Rejected.is_terminal());
        assert!(Acked.is_terminal());
        assert!(!Completed.is_terminal());
    }
}
