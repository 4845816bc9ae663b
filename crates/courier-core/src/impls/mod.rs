//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryBroker**: 開発・テスト用の broker（切断の fault injection 付き）
//! - **PgmqBroker**: PostgreSQL の pgmq 拡張を使う本番用 broker（feature `pgmq`）

pub mod inmem_broker;
#[cfg(feature = "pgmq")]
pub mod pgmq_broker;

pub use self::inmem_broker::InMemoryBroker;
#[cfg(feature = "pgmq")]
pub use self::pgmq_broker::PgmqBroker;
