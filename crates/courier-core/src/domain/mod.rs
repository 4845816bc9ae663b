//! Domain model (tasks, metadata, outcomes, state machine, retry decisions).
//!
//! ここにある型は broker や runtime に依存しない。
//! wire 表現は `crate::codec`、実行は `crate::app` が担当する。

pub mod decision;
pub mod errors;
pub mod ids;
pub mod metadata;
pub mod outcome;
pub mod retry;
pub mod route;
pub mod state;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, ExecutionError};
pub use ids::TaskId;
pub use metadata::{MetaValue, Metadata};
pub use outcome::{Outcome, OutcomeReport, OutcomeStatus};
pub use retry::RetryPolicy;
pub use route::Route;
pub use state::TaskState;
pub use task::{Task, TaskType};
