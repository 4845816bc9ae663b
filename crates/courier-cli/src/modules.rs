//! Built-in modules and the startup discovery table.

use async_trait::async_trait;
use courier_core::typed::{Handler, Job};
use courier_core::{Capabilities, ExecutionError, Module, ModuleEntry, TaskContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Returns the payload unchanged.
pub struct Echo;

#[async_trait]
impl Module for Echo {
    async fn execute(&self, ctx: &TaskContext) -> Result<(), ExecutionError> {
        ctx.succeed(ctx.payload().to_vec());
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default().idempotent()
    }
}

/// Payload is a JSON number of milliseconds, e.g. `250`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sleep {
    pub ms: u64,
}

impl Job for Sleep {
    const TYPE: &'static str = "sleep";
}

pub struct SleepHandler;

#[async_trait]
impl Handler<Sleep> for SleepHandler {
    async fn handle(&self, job: Sleep, ctx: &TaskContext) -> Result<serde_json::Value, ExecutionError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(ExecutionError::transient(format!("sleep of {}ms cancelled", job.ms))),
            _ = tokio::time::sleep(Duration::from_millis(job.ms)) => Ok(serde_json::json!({ "slept_ms": job.ms })),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default().idempotent()
    }
}

/// Always fails with a retryable error.
pub struct Fail;

#[async_trait]
impl Module for Fail {
    async fn execute(&self, ctx: &TaskContext) -> Result<(), ExecutionError> {
        Err(ExecutionError::transient(format!(
            "fail module refused task {} (attempt {})",
            ctx.id(),
            ctx.retry_count() + 1
        )))
    }
}

pub fn discover() -> Vec<ModuleEntry> {
    vec![
        ModuleEntry::new("echo", || Arc::new(Echo) as Arc<dyn Module>),
        ModuleEntry::typed::<Sleep, _, _>(|| SleepHandler),
        ModuleEntry::new("fail", || Arc::new(Fail) as Arc<dyn Module>),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::module::ModuleRegistry;

    #[test]
    fn discovery_table_registers_cleanly() {
        let registry = ModuleRegistry::from_entries(discover()).unwrap();
        let ids: Vec<_> = registry.modules().map(|m| m.identifier().to_string()).collect();
        assert_eq!(ids, vec!["echo", "sleep", "fail"]);
        assert!(registry.resolve("echo").unwrap().capabilities().idempotent);
    }

    #[test]
    fn sleep_payload_is_a_bare_number() {
        let job: Sleep = serde_json::from_slice(b"250").unwrap();
        assert_eq!(job.ms, 250);
    }
}
