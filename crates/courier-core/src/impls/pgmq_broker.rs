//! PgmqBroker - PostgreSQL の pgmq 拡張を broker として使う
//!
//! pgmq の SQL 関数を sqlx で直接呼ぶ:
//! - receive: `pgmq.read`（visibility timeout 付き。ack されなければ再び見えるようになる）
//! - ack: `pgmq.delete`
//! - nack(requeue): `pgmq.set_vt(.., 0)` で即座に再配送可能にする
//! - nack(drop): `pgmq.archive`（監査用に archive テーブルへ移す）
//! - publish: `pgmq.send`（delay は秒単位）
//!
//! - bind / broadcast: `courier_bindings` テーブルに (exchange, queue) を持ち、
//!   bind された全 queue へ `pgmq.send` する
//!
//! pgmq のメッセージは jsonb なので、envelope bytes は `{"envelope": [..]}` で包む。
//! pgmq の queue 名は英数字と `_` のみなので、それ以外の文字は `_` に置き換える
//! （`node.host-1` → `node_host_1`）。

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::ports::{Broker, BrokerChannel, BrokerError, Delivery, DeliveryTag};

#[derive(Debug, Serialize, Deserialize)]
struct Wrapped {
    envelope: Vec<u8>,
}

pub struct PgmqBroker {
    url: SecretString,
    max_connections: u32,
    poll_interval: Duration,
    visibility_timeout: Duration,
}

impl PgmqBroker {
    pub fn new(url: SecretString) -> Self {
        Self {
            url,
            max_connections: 5,
            poll_interval: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// How long to sleep between empty reads.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long a read message stays invisible before pgmq redelivers it.
    pub fn with_visibility_timeout(mut self, vt: Duration) -> Self {
        self.visibility_timeout = vt;
        self
    }
}

#[async_trait]
impl Broker for PgmqBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(self.url.expose_secret())
            .await
            .map_err(classify)?;
        Ok(Arc::new(PgmqChannel {
            pool,
            poll_interval: self.poll_interval,
            vt_seconds: seconds(self.visibility_timeout).max(1),
        }))
    }

    fn name(&self) -> &str {
        "pgmq"
    }
}

struct PgmqChannel {
    pool: PgPool,
    poll_interval: Duration,
    vt_seconds: i32,
}

const CREATE_BINDINGS: &str = "CREATE TABLE IF NOT EXISTS courier_bindings (\
    exchange TEXT NOT NULL, queue TEXT NOT NULL, PRIMARY KEY (exchange, queue))";

impl PgmqChannel {
    async fn ensure_bindings(&self) -> Result<(), BrokerError> {
        sqlx::query(CREATE_BINDINGS)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn read_one(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let row = sqlx::query_as::<_, (i64, i32, serde_json::Value)>(
            "SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, 1)",
        )
        .bind(queue_name(queue))
        .bind(self.vt_seconds)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(|(msg_id, read_ct, message)| {
            // 形が違うメッセージは生の JSON を渡し、codec に poison として弾かせる
            let body = match serde_json::from_value::<Wrapped>(message.clone()) {
                Ok(wrapped) => wrapped.envelope,
                Err(_) => message.to_string().into_bytes(),
            };
            Delivery {
                tag: DeliveryTag(msg_id as u64),
                body,
                redelivered: read_ct > 1,
            }
        }))
    }
}

#[async_trait]
impl BrokerChannel for PgmqChannel {
    async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name(queue))
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.read_one(queue).await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn publish(&self, topic: &str, body: Vec<u8>, delay: Duration) -> Result<(), BrokerError> {
        let message = serde_json::to_value(Wrapped { envelope: body })
            .map_err(|e| BrokerError::Operation(format!("wrap envelope: {e}")))?;
        sqlx::query("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name(topic))
            .bind(message)
            .bind(seconds(delay))
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn bind(&self, exchange: &str, queue: &str) -> Result<(), BrokerError> {
        self.ensure_bindings().await?;
        sqlx::query("INSERT INTO courier_bindings (exchange, queue) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(exchange)
            .bind(queue_name(queue))
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn broadcast(&self, exchange: &str, body: Vec<u8>) -> Result<usize, BrokerError> {
        self.ensure_bindings().await?;
        let message = serde_json::to_value(Wrapped { envelope: body })
            .map_err(|e| BrokerError::Operation(format!("wrap envelope: {e}")))?;
        let sent = sqlx::query("SELECT pgmq.send(queue, $2) FROM courier_bindings WHERE exchange = $1")
            .bind(exchange)
            .bind(message)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        Ok(sent.len())
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue_name(queue))
            .bind(tag.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let sql = if requeue {
            "SELECT pgmq.set_vt($1, $2, 0)"
        } else {
            "SELECT pgmq.archive($1, $2)"
        };
        sqlx::query(sql)
            .bind(queue_name(queue))
            .bind(tag.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Maps a courier queue name onto pgmq's `[a-z0-9_]` alphabet.
fn queue_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Rounds up to whole seconds (pgmq's delay unit).
fn seconds(duration: Duration) -> i32 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}

/// Network and pool failures mean the channel has to be replaced.
fn classify(error: sqlx::Error) -> BrokerError {
    let lost = matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    );
    if lost {
        BrokerError::ConnectionLost(error.to_string())
    } else {
        BrokerError::Operation(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(Duration::ZERO, 0)]
    #[case::whole(Duration::from_secs(3), 3)]
    #[case::rounds_up(Duration::from_millis(1500), 2)]
    #[case::sub_second(Duration::from_millis(1), 1)]
    fn delays_round_up_to_seconds(#[case] delay: Duration, #[case] expected: i32) {
        assert_eq!(seconds(delay), expected);
    }

    #[rstest]
    #[case::plain("tasks", "tasks")]
    #[case::node("node.host-1", "node_host_1")]
    #[case::replies("node.Web01.replies", "node_web01_replies")]
    fn queue_names_fit_pgmq(#[case] queue: &str, #[case] expected: &str) {
        assert_eq!(queue_name(queue), expected);
    }

    #[test]
    fn pool_errors_are_connection_errors() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_connection());
        assert!(!classify(sqlx::Error::RowNotFound).is_connection());
    }

    #[test]
    fn envelope_is_wrapped_as_json() {
        let value = serde_json::to_value(Wrapped { envelope: vec![1, 2] }).unwrap();
        assert_eq!(value, serde_json::json!({ "envelope": [1, 2] }));
    }
}
