//! Logging setup and task span helpers.
//!
//! `init_logging` installs a tracing-subscriber with an `EnvFilter`
//! (`RUST_LOG` wins over the configured level) and a compact or JSON fmt layer.
//! Each dispatched task gets a `task.dispatch` span whose `task.state` field
//! follows the task through the dispatcher.

use tracing::Span;

use crate::config::{LogFormat, LoggingConfig};
use crate::domain::{Task, TaskState};
use crate::error::{CourierError, Result};

/// Initialise the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format {
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    installed.map_err(|e| CourierError::Telemetry(e.to_string()))
}

/// Start the span for one dispatched task.
///
/// `task.state` is declared empty and filled in by [`record_state_transition`].
pub fn task_span(task: &Task) -> Span {
    tracing::info_span!(
        "task.dispatch",
        "task.id" = %task.id(),
        "task.type" = %task.task_type(),
        "task.retry" = task.retry_count(),
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition on `span`. Terminal states log at `info`.
pub fn record_state_transition(span: &Span, from: TaskState, to: TaskState) {
    span.record("task.state", to.as_str());
    span.in_scope(|| {
        if to.is_terminal() {
            tracing::info!(from = from.as_str(), to = to.as_str(), "task finished");
        } else {
            tracing::debug!(from = from.as_str(), to = to.as_str(), "state_transition");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_can_be_recorded_without_a_subscriber() {
        let task = Task::new("t1", "echo", Vec::new());
        let span = task_span(&task);
        record_state_transition(&span, TaskState::Received, TaskState::Resolving);
        record_state_transition(&span, TaskState::Resolving, TaskState::Rejected);
    }
}
