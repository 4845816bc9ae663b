//! App - アプリケーション層
//!
//! ports と module を組み合わせて dispatch エンジンを構成します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 登録テーブル・設定・broker のワイヤリング
//! - **BrokerConnector**: 単一の broker 接続、受信ループ、再接続
//! - **Dispatcher**: 解決 → 実行 → 判定 → ack
//! - **WorkerPool**: 全体とモジュールごとの同時実行数の上限
//! - **DispatchCounters**: 処理件数のカウンタ

pub mod builder;
pub mod connector;
pub mod dispatcher;
pub mod pool;
pub mod status;

pub use self::builder::{App, AppBuilder};
pub use self::connector::{BrokerConnector, ConnectorConfig, Inbound, Receipt, Settlement, TaskStream};
pub use self::dispatcher::{DispatchPolicy, Dispatcher};
pub use self::pool::{Execution, ExecutionPanic, Reservation, Slot, WorkerPool};
pub use self::status::{DispatchCounters, DispatchCounts};
