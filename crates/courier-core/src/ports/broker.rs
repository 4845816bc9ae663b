//! Broker port - message broker との境界
//!
//! # 学習ポイント
//! - 接続 (`Broker`) とチャネル (`BrokerChannel`) を trait object として分離
//! - エラーを「接続が切れた」かどうかで分類し、再接続の判断に使う
//!
//! # 配送モデル
//! - `receive` で 1 件受け取り、`ack` / `nack` で確定する（at-least-once）
//! - ack されないまま接続が切れたメッセージは broker が再配送する
//! - delivery tag はチャネルごとに有効。別のチャネルで ack してはいけない
//!
//! # Broadcast
//! exchange は queue の集合。`bind` した queue 全てに `broadcast` のコピーが届く。
//! binding は broker 側に残る（再接続しても消えない）。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Broker-assigned handle for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw message as received from the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// The broker has delivered this message before.
    pub redelivered: bool,
}

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("broker operation failed: {0}")]
    Operation(String),

    #[error("broker unavailable after {attempts} connection attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    #[error("broker connector is closed")]
    Closed,
}

impl BrokerError {
    /// True when the channel is unusable and has to be replaced.
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_))
    }
}

/// Opens channels to a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Transport name, for logs.
    fn name(&self) -> &str;
}

/// One live connection to the broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Makes sure `queue` exists.
    async fn declare(&self, queue: &str) -> Result<(), BrokerError>;

    /// Waits up to `wait` for the next message on `queue`.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Publishes `body` to `topic`, visible after `delay`.
    async fn publish(&self, topic: &str, body: Vec<u8>, delay: Duration) -> Result<(), BrokerError>;

    /// Subscribes `queue` to everything broadcast on `exchange`. Idempotent.
    async fn bind(&self, exchange: &str, queue: &str) -> Result<(), BrokerError>;

    /// Publishes a copy of `body` to every queue bound to `exchange`.
    ///
    /// Returns how many queues received it.
    async fn broadcast(&self, exchange: &str, body: Vec<u8>) -> Result<usize, BrokerError>;

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// `requeue = false` drops (or dead-letters) the message.
    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
