//! Ports - 抽象化レイヤー
//!
//! 外部システム（message broker, 時刻）へのインターフェースを定義する。
//! 実装は `crate::impls` にある。
//!
//! # 設計原則
//! - broker は配送と ack のみを担当し、タスクの状態は持たない
//! - 接続（`Broker`）とチャネル（`BrokerChannel`）を分け、再接続ではチャネルだけを差し替える

pub mod broker;
pub mod clock;

pub use self::broker::{Broker, BrokerChannel, BrokerError, Delivery, DeliveryTag};
pub use self::clock::{Clock, FixedClock, SystemClock};
