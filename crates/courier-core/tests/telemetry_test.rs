//! Logging setup installs a process-global subscriber, so it gets its own test binary.

use courier_core::config::{LogFormat, LoggingConfig};
use courier_core::domain::TaskState;
use courier_core::{CourierError, Task, telemetry};

#[test]
fn logging_installs_once_per_process() {
    let config = LoggingConfig {
        level: "debug".to_string(),
        format: LogFormat::Json,
    };

    telemetry::init_logging(&config).unwrap();

    // 既に subscriber があるので二度目は失敗する
    assert!(matches!(
        telemetry::init_logging(&LoggingConfig::default()),
        Err(CourierError::Telemetry(_))
    ));

    let task = Task::new("t1", "echo", Vec::new());
    let span = telemetry::task_span(&task);
    telemetry::record_state_transition(&span, TaskState::Received, TaskState::Resolving);
    telemetry::record_state_transition(&span, TaskState::Resolving, TaskState::Rejected);
}
