//! courier-core
//!
//! Broker-driven task dispatch: tasks arrive on a message queue, are routed to a
//! registered module by `task_type`, run under concurrency and time limits, and
//! their outcomes are published back to the broker.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（Task, Metadata, Outcome, TaskState, Decision, RetryPolicy）
//! - **codec**: wire envelope の encode / decode
//! - **ports**: 抽象化レイヤー（Broker, BrokerChannel, Clock）
//! - **module**: Module trait, TaskContext, ModuleRegistry
//! - **typed**: 型付き Job / Handler API
//! - **app**: エンジン本体（builder, connector, dispatcher, pool, status）
//! - **impls**: 実装（InMemoryBroker, PgmqBroker）
//! - **config**, **telemetry**, **error**: 設定・ログ・エラー

pub mod app;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod module;
pub mod ports;
pub mod telemetry;
pub mod typed;

pub use app::{App, AppBuilder, DispatchCounts};
pub use config::Config;
pub use domain::{ExecutionError, Metadata, Outcome, Route, Task, TaskId, TaskType};
pub use error::{CourierError, Result};
pub use module::{Capabilities, Module, ModuleEntry, TaskContext};
