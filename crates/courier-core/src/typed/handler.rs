//! Handler trait - Job を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<J>)
//! - Type erasure パターン (TypedModule<J, H> → dyn Module)
//! - `PhantomData<fn() -> J>` で J の Send/Sync に依存しない

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

use super::job::Job;
use crate::domain::ExecutionError;
use crate::module::{Capabilities, Module, ModuleEntry, TaskContext};

/// Handler は decode 済みの Job を処理し、結果を JSON で返す
///
/// # ジェネリクスによる型安全性
/// - `Handler<Resize>` は `Resize` しか受け取れない
/// - コンパイル時に Job と Handler の対応が保証される
#[async_trait]
pub trait Handler<J: Job>: Send + Sync {
    async fn handle(&self, job: J, ctx: &TaskContext) -> Result<serde_json::Value, ExecutionError>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

/// Adapts a `Handler<J>` into a `Module`.
///
/// payload の decode に失敗した場合はリトライしても直らないので permanent failure。
pub struct TypedModule<J, H> {
    handler: H,
    _marker: PhantomData<fn() -> J>,
}

impl<J: Job, H: Handler<J>> TypedModule<J, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<J: Job, H: Handler<J>> Module for TypedModule<J, H> {
    async fn execute(&self, ctx: &TaskContext) -> Result<(), ExecutionError> {
        let job: J = serde_json::from_slice(ctx.payload())
            .map_err(|e| ExecutionError::permanent(format!("json decode: {e}")))?;
        let value = self.handler.handle(job, ctx).await?;
        if !ctx.has_reported() {
            let result = serde_json::to_vec(&value)
                .map_err(|e| ExecutionError::permanent(format!("json encode: {e}")))?;
            ctx.succeed(result);
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.handler.capabilities()
    }
}

impl ModuleEntry {
    /// Registry entry for a typed handler, keyed by `J::TYPE`.
    pub fn typed<J, H, F>(factory: F) -> Self
    where
        J: Job,
        H: Handler<J> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        ModuleEntry::new(J::TYPE, move || -> Arc<dyn Module> {
            Arc::new(TypedModule::<J, H>::new(factory()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Outcome, Task};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    impl Job for Add {
        const TYPE: &'static str = "math.add";
    }

    struct AddHandler;

    #[async_trait]
    impl Handler<Add> for AddHandler {
        async fn handle(&self, job: Add, _ctx: &TaskContext) -> Result<serde_json::Value, ExecutionError> {
            Ok(json!({ "sum": job.a + job.b }))
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default().idempotent()
        }
    }

    async fn run(payload: &[u8]) -> (Result<(), ExecutionError>, Outcome) {
        let module = TypedModule::<Add, _>::new(AddHandler);
        let task = Task::new("t1", Add::TYPE, payload.to_vec());
        let (ctx, rx) = TaskContext::new(task, CancellationToken::new());
        let result = module.execute(&ctx).await;
        ctx.finish(result.clone());
        (result, rx.await.unwrap())
    }

    #[tokio::test]
    async fn typed_module_decodes_and_reports_json() {
        let payload = Add { a: 2, b: 3 }.to_payload().unwrap();
        let (result, outcome) = run(&payload).await;

        assert!(result.is_ok());
        assert_eq!(outcome, Outcome::success(br#"{"sum":5}"#.to_vec()));
    }

    #[tokio::test]
    async fn decode_failure_is_permanent() {
        let (result, outcome) = run(b"not json").await;

        assert!(!result.unwrap_err().is_retryable());
        assert!(matches!(outcome, Outcome::Failure { retryable: false, .. }));
    }

    #[test]
    fn typed_entry_uses_job_type_and_handler_capabilities() {
        let entry = ModuleEntry::typed::<Add, _, _>(|| AddHandler);
        assert_eq!(entry.identifier().as_str(), "math.add");

        let registry = crate::module::ModuleRegistry::from_entries([entry]).unwrap();
        assert!(registry.resolve("math.add").unwrap().capabilities().idempotent);
    }
}
