use std::time::Duration;
use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::domain::{ErrorKind, ExecutionError, TaskType};
use crate::module::RegistryError;
use crate::ports::BrokerError;

#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no module registered for task_type={0}")]
    UnknownTaskType(TaskType),

    #[error("task execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("module {identifier} failed to {phase}: {source}")]
    Lifecycle {
        identifier: TaskType,
        phase: &'static str,
        source: ExecutionError,
    },

    #[error("logging setup failed: {0}")]
    Telemetry(String),
}

pub type Result<T, E = CourierError> = std::result::Result<T, E>;

impl CourierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CourierError::Codec(_) => ErrorKind::Permanent,
            CourierError::Registry(RegistryError::UnknownModule(_)) => ErrorKind::Routing,
            CourierError::Registry(_) => ErrorKind::Fatal,
            CourierError::Broker(BrokerError::ConnectionLost(_)) => ErrorKind::Transient,
            CourierError::Broker(BrokerError::Unavailable { .. }) => ErrorKind::Fatal,
            CourierError::Broker(_) => ErrorKind::Infrastructure,
            CourierError::Config(_) => ErrorKind::Fatal,
            CourierError::UnknownTaskType(_) => ErrorKind::Routing,
            CourierError::Execution(e) => e.kind(),
            CourierError::Timeout(_) => ErrorKind::Transient,
            CourierError::Lifecycle { .. } => ErrorKind::Fatal,
            CourierError::Telemetry(_) => ErrorKind::Fatal,
        }
    }

    /// Process exit code for a fatal error.
    ///
    /// 2: broker unavailable, 3: module registration failed, 1: anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            CourierError::Broker(BrokerError::Unavailable { .. }) => 2,
            CourierError::Registry(_) | CourierError::Lifecycle { .. } => 3,
            _ => 1,
        }
    }
}
