//! Module - タスクを実行するプラグイン
//!
//! # 二層構造
//! - **Module trait**: object-safe。registry は `Arc<dyn Module>` で保持する
//! - **typed API** (`crate::typed`): JSON payload を型に decode して `Module` に変換する
//!
//! # 登録の流れ
//! 1. 起動時に `ModuleEntry` のテーブルを組み立てる
//! 2. `RegistryBuilder` に登録（重複・不正な設定はここで失敗）
//! 3. `freeze()` で不変の `ModuleRegistry` にする

pub mod context;
pub mod registry;

use async_trait::async_trait;

use crate::domain::ExecutionError;

pub use self::context::TaskContext;
pub use self::registry::{ModuleEntry, ModuleRegistry, RegisteredModule, RegistryBuilder, RegistryError};

/// Capability flags a module declares about itself.
///
/// 登録時に一度だけ読み取られ、`RegisteredModule` にキャッシュされる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `execute` blocks the thread; run it on the blocking pool.
    pub synchronous: bool,
    /// Re-running the task has no additional effect.
    pub idempotent: bool,
    /// Failed executions may be retried.
    pub retryable: bool,
}

impl Capabilities {
    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            synchronous: false,
            idempotent: false,
            retryable: true,
        }
    }
}

/// A task handler.
///
/// `execute` reports through the context (`succeed` / `fail`). Returning
/// without reporting counts as success with an empty result, and returning
/// `Err` counts as a failure with the error's retryability.
///
/// # 使用例
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Module for Echo {
///     async fn execute(&self, ctx: &TaskContext) -> Result<(), ExecutionError> {
///         ctx.succeed(ctx.payload().to_vec());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Module: Send + Sync {
    async fn execute(&self, ctx: &TaskContext) -> Result<(), ExecutionError>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Called once before the dispatcher starts consuming.
    async fn start(&self) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Called once after the dispatcher has drained.
    async fn stop(&self) -> Result<(), ExecutionError> {
        Ok(())
    }
}
