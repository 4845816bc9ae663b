//! BrokerConnector - broker 接続の所有者
//!
//! # 責務
//! - 接続（チャネル）を 1 本だけ持ち、切れたら backoff 付きで張り直す
//! - 受信ループ: receive → decode → bounded channel（prefetch）へ送る
//!   input queue と自ノードの node queue それぞれに 1 本ずつ走り、同じ channel に流す
//! - decode できないメッセージは requeue せずに nack（poison）
//! - id の無いタスクにはここで ULID ベースの id を付ける
//! - ack / nack / publish / route の窓口
//!
//! # 世代（generation）
//! 接続を張り直すたびに generation が増える。delivery tag は取得した接続でしか
//! 有効でないため、古い generation の receipt に対する ack はスキップし、
//! broker の再配送に任せる。
//!
//! # Backpressure
//! 受信ループは channel に空きが出るまで次の receive をしない。
//! dispatcher は worker slot を確保してから channel を読む。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::status::DispatchCounters;
use crate::codec::{self, CodecError};
use crate::domain::route::node_queue;
use crate::domain::{OutcomeReport, RetryPolicy, Route, Task, TaskId};
use crate::ports::{Broker, BrokerChannel, BrokerError, Clock, Delivery, DeliveryTag};

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub input_queue: String,
    /// This node's own queue, consumed next to the input queue.
    pub node_queue: Option<String>,
    /// Exchange the node queue is bound to for broadcasts.
    pub broadcast_exchange: Option<String>,
    /// Other queues/topics declared on every (re)connect.
    pub declare: Vec<String>,
    /// Capacity of the decoded-task channel.
    pub prefetch: usize,
    /// Upper bound on one broker receive call.
    pub receive_wait: Duration,
    pub reconnect: RetryPolicy,
    pub max_reconnect_attempts: u32,
}

impl ConnectorConfig {
    /// Queues the receive loops consume, input queue first.
    pub fn consumed_queues(&self) -> Vec<String> {
        let mut queues = vec![self.input_queue.clone()];
        if let Some(node) = &self.node_queue {
            if *node != self.input_queue {
                queues.push(node.clone());
            }
        }
        queues
    }

    pub fn new(input_queue: impl Into<String>) -> Self {
        Self {
            input_queue: input_queue.into(),
            node_queue: None,
            broadcast_exchange: None,
            declare: Vec::new(),
            prefetch: 16,
            receive_wait: Duration::from_millis(500),
            reconnect: RetryPolicy::new(Duration::from_millis(500), 2.0, Duration::from_secs(30)).with_jitter(),
            max_reconnect_attempts: 10,
        }
    }
}

/// Ties a decoded task to the delivery that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    task_id: TaskId,
    queue: Arc<str>,
    tag: DeliveryTag,
    generation: u64,
    redelivered: bool,
}

impl Receipt {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Queue the delivery came from; acks and retries go back to it.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    /// Connection generation the delivery arrived on.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }
}

/// A decoded task waiting for dispatch.
#[derive(Debug)]
pub struct Inbound {
    pub task: Task,
    pub receipt: Receipt,
}

/// Decoded tasks in arrival order.
///
/// `Err` is yielded once, when the broker is gone for good; the stream ends after it.
pub struct TaskStream {
    rx: mpsc::Receiver<Result<Inbound, BrokerError>>,
}

impl TaskStream {
    pub async fn next(&mut self) -> Option<Result<Inbound, BrokerError>> {
        self.rx.recv().await
    }
}

/// Result of an ack or nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Settled,
    /// The delivery's connection is gone; the broker will redeliver it.
    Stale,
}

#[derive(Clone)]
struct Connection {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

/// The single broker connection and its serialized reconnect.
struct Link {
    broker: Arc<dyn Broker>,
    current: RwLock<Option<Connection>>,
    reconnecting: tokio::sync::Mutex<()>,
    generations: AtomicU64,
    exhausted: AtomicBool,
    policy: RetryPolicy,
    max_attempts: u32,
    queues: Vec<String>,
    /// (exchange, queue) bound on every (re)connect.
    binding: Option<(String, String)>,
    counters: Arc<DispatchCounters>,
}

impl Link {
    async fn current(&self) -> Option<Connection> {
        self.current.read().await.clone()
    }

    async fn get(&self) -> Result<Connection, BrokerError> {
        match self.current().await {
            Some(conn) => Ok(conn),
            None => self.replace(None).await,
        }
    }

    /// Replaces connection `failed` (or opens the first one).
    ///
    /// Concurrent callers that saw the same failure share one reconnect.
    async fn replace(&self, failed: Option<u64>) -> Result<Connection, BrokerError> {
        let _guard = self.reconnecting.lock().await;

        if let Some(conn) = self.current().await {
            if Some(conn.generation) != failed {
                return Ok(conn);
            }
        }
        if self.exhausted.load(Ordering::Acquire) {
            return Err(BrokerError::Unavailable {
                attempts: self.max_attempts,
                last_error: "reconnect attempts already exhausted".into(),
            });
        }

        let stale = self.current.write().await.take();
        if let Some(stale) = stale {
            if let Err(e) = stale.channel.close().await {
                debug!(error = %e, "closing stale channel failed");
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.open().await {
                Ok(channel) => {
                    let generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
                    if failed.is_some() {
                        self.counters.record_reconnect();
                        info!(broker = self.broker.name(), generation, attempt, "broker reconnected");
                    } else {
                        info!(broker = self.broker.name(), generation, "broker connected");
                    }
                    let conn = Connection { generation, channel };
                    *self.current.write().await = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) if attempt >= self.max_attempts => {
                    self.exhausted.store(true, Ordering::Release);
                    error!(broker = self.broker.name(), attempts = attempt, error = %e, "broker unavailable; giving up");
                    return Err(BrokerError::Unavailable {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.policy.next_delay(attempt);
                    warn!(
                        broker = self.broker.name(),
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker connect failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.broker.connect().await?;
        for queue in &self.queues {
            channel.declare(queue).await?;
        }
        if let Some((exchange, queue)) = &self.binding {
            channel.bind(exchange, queue).await?;
        }
        Ok(channel)
    }
}

struct Inner {
    link: Link,
    config: ConnectorConfig,
    clock: Arc<dyn Clock>,
    counters: Arc<DispatchCounters>,
    stop: CancellationToken,
    closed: AtomicBool,
    receivers: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    /// Decodes one delivery. Poison is dropped here and never reaches the stream.
    async fn decode(&self, conn: &Connection, queue: &Arc<str>, delivery: Delivery) -> Option<Inbound> {
        match codec::decode_task(&delivery.body) {
            Ok(mut task) => {
                if task.assign_id_if_missing(|| TaskId::generate_with(self.clock.as_ref())) {
                    debug!(task.id = %task.id(), delivery.tag = %delivery.tag, "assigned id to task without one");
                }
                task.stamp_received(self.clock.now());
                let receipt = Receipt {
                    task_id: task.id().clone(),
                    queue: Arc::clone(queue),
                    tag: delivery.tag,
                    generation: conn.generation,
                    redelivered: delivery.redelivered,
                };
                Some(Inbound { task, receipt })
            }
            Err(e) => {
                match &e {
                    CodecError::UnsupportedVersion { .. } => {
                        error!(queue = %queue, delivery.tag = %delivery.tag, error = %e, "unsupported envelope version; dropping message");
                    }
                    _ => {
                        error!(queue = %queue, delivery.tag = %delivery.tag, bytes = delivery.body.len(), error = %e, "poison message; dropping");
                    }
                }
                self.counters.record_poison();
                if let Err(e) = conn.channel.nack(queue, delivery.tag, false).await {
                    warn!(delivery.tag = %delivery.tag, error = %e, "failed to drop poison message");
                }
                None
            }
        }
    }
}

/// Owns the broker link. Clones share it.
#[derive(Clone)]
pub struct BrokerConnector {
    inner: Arc<Inner>,
}

impl BrokerConnector {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: ConnectorConfig,
        clock: Arc<dyn Clock>,
        counters: Arc<DispatchCounters>,
    ) -> Self {
        let mut queues = config.consumed_queues();
        for queue in &config.declare {
            if !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        let link = Link {
            broker,
            current: RwLock::new(None),
            reconnecting: tokio::sync::Mutex::new(()),
            generations: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
            policy: config.reconnect.clone(),
            max_attempts: config.max_reconnect_attempts.max(1),
            queues,
            binding: config
                .broadcast_exchange
                .clone()
                .zip(config.node_queue.clone()),
            counters: Arc::clone(&counters),
        };
        Self {
            inner: Arc::new(Inner {
                link,
                config,
                clock,
                counters,
                stop: CancellationToken::new(),
                closed: AtomicBool::new(false),
                receivers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn input_queue(&self) -> &str {
        &self.inner.config.input_queue
    }

    /// Generation of the live connection, if any.
    pub async fn generation(&self) -> Option<u64> {
        self.inner.link.current().await.map(|c| c.generation)
    }

    pub fn node_queue(&self) -> Option<&str> {
        self.inner.config.node_queue.as_deref()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    /// Connects (with backoff) and starts one receive loop per consumed queue.
    pub async fn start(&self) -> Result<TaskStream, BrokerError> {
        self.ensure_open()?;
        self.inner.link.get().await?;
        let (tx, rx) = mpsc::channel(self.inner.config.prefetch.max(1));
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .config
            .consumed_queues()
            .into_iter()
            .map(|queue| tokio::spawn(receive_loop(Arc::clone(&self.inner), queue.into(), tx.clone())))
            .collect();
        let previous = std::mem::replace(
            &mut *self.inner.receivers.lock().unwrap_or_else(PoisonError::into_inner),
            handles,
        );
        for handle in previous {
            handle.abort();
        }
        Ok(TaskStream { rx })
    }

    /// Stops pulling new deliveries. Settling and publishing keep working.
    pub fn stop_receiving(&self) {
        self.inner.stop.cancel();
    }

    /// Declares `queue` on the live connection.
    pub async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.send(Target::Declare(queue), Vec::new()).await.map(|_| ())
    }

    /// Publishes, reconnecting on connection loss.
    pub async fn publish(&self, topic: &str, body: Vec<u8>, delay: Duration) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.send(Target::Queue { topic, delay }, body).await.map(|_| ())
    }

    /// Publishes a task envelope along `route`. Returns how many queues received it.
    pub async fn route(&self, route: &Route, body: Vec<u8>) -> Result<usize, BrokerError> {
        self.ensure_open()?;
        match route {
            Route::Any => {
                self.send(
                    Target::Queue {
                        topic: self.input_queue(),
                        delay: Duration::ZERO,
                    },
                    body,
                )
                .await
            }
            Route::Node(id) => {
                let queue = node_queue(id);
                self.send(Target::Declare(&queue), Vec::new()).await?;
                self.send(
                    Target::Queue {
                        topic: &queue,
                        delay: Duration::ZERO,
                    },
                    body,
                )
                .await
            }
            Route::Broadcast => {
                let exchange = self
                    .inner
                    .config
                    .broadcast_exchange
                    .as_deref()
                    .ok_or_else(|| BrokerError::Operation("no broadcast exchange configured".into()))?;
                self.send(Target::Broadcast(exchange), body).await
            }
        }
    }

    /// Takes the next outcome from `queue`, waiting up to `wait`.
    ///
    /// The delivery is acked once decoded. Undecodable replies are dropped and counted as poison.
    pub async fn next_reply(&self, queue: &str, wait: Duration) -> Result<Option<OutcomeReport>, BrokerError> {
        self.ensure_open()?;
        let conn = self.inner.link.get().await?;
        let Some(delivery) = conn.channel.receive(queue, wait).await? else {
            return Ok(None);
        };
        match codec::decode_outcome(&delivery.body) {
            Ok(report) => {
                conn.channel.ack(queue, delivery.tag).await?;
                Ok(Some(report))
            }
            Err(e) => {
                error!(queue, delivery.tag = %delivery.tag, error = %e, "undecodable reply; dropping");
                self.inner.counters.record_poison();
                conn.channel.nack(queue, delivery.tag, false).await?;
                Ok(None)
            }
        }
    }

    async fn send(&self, target: Target<'_>, body: Vec<u8>) -> Result<usize, BrokerError> {
        let link = &self.inner.link;
        let mut conn = link.get().await?;
        let mut attempt = 1;
        loop {
            let result = match target {
                Target::Queue { topic, delay } => conn.channel.publish(topic, body.clone(), delay).await.map(|()| 1),
                Target::Broadcast(exchange) => conn.channel.broadcast(exchange, body.clone()).await,
                Target::Declare(queue) => conn.channel.declare(queue).await.map(|()| 0),
            };
            match result {
                Ok(delivered) => return Ok(delivered),
                Err(e) if e.is_connection() && attempt < link.max_attempts => {
                    warn!(target = %target, error = %e, "broker call hit a lost connection; reconnecting");
                    conn = link.replace(Some(conn.generation)).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn ack(&self, receipt: &Receipt) -> Result<Settlement, BrokerError> {
        self.settle(receipt, None).await
    }

    pub async fn nack(&self, receipt: &Receipt, requeue: bool) -> Result<Settlement, BrokerError> {
        self.settle(receipt, Some(requeue)).await
    }

    async fn settle(&self, receipt: &Receipt, nack: Option<bool>) -> Result<Settlement, BrokerError> {
        let conn = self
            .inner
            .link
            .current()
            .await
            .filter(|c| c.generation == receipt.generation);
        let Some(conn) = conn else {
            warn!(
                task.id = %receipt.task_id,
                delivery.tag = %receipt.tag,
                generation = receipt.generation,
                "delivery belongs to a replaced connection; leaving it to broker redelivery"
            );
            return Ok(Settlement::Stale);
        };

        let queue = receipt.queue();
        let result = match nack {
            None => conn.channel.ack(queue, receipt.tag).await,
            Some(requeue) => conn.channel.nack(queue, receipt.tag, requeue).await,
        };
        match result {
            Ok(()) => Ok(Settlement::Settled),
            Err(e) if e.is_connection() => {
                warn!(task.id = %receipt.task_id, error = %e, "connection lost while settling; broker will redeliver");
                Ok(Settlement::Stale)
            }
            Err(e) => Err(e),
        }
    }

    /// Stops the receive loops and closes the channel. Later publishes fail with `Closed`.
    pub async fn close(&self) {
        self.stop_receiving();
        self.inner.closed.store(true, Ordering::Release);
        let handles = std::mem::take(&mut *self.inner.receivers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(conn) = self.inner.link.current.write().await.take() {
            if let Err(e) = conn.channel.close().await {
                debug!(error = %e, "closing broker channel failed");
            }
        }
    }
}

/// What a [`BrokerConnector::send`] call does on the channel.
#[derive(Clone, Copy)]
enum Target<'a> {
    Queue { topic: &'a str, delay: Duration },
    Broadcast(&'a str),
    Declare(&'a str),
}

impl std::fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Queue { topic, .. } => write!(f, "publish {topic}"),
            Target::Broadcast(exchange) => write!(f, "broadcast {exchange}"),
            Target::Declare(queue) => write!(f, "declare {queue}"),
        }
    }
}

async fn receive_loop(inner: Arc<Inner>, queue: Arc<str>, tx: mpsc::Sender<Result<Inbound, BrokerError>>) {
    let mut conn = match inner.link.get().await {
        Ok(conn) => conn,
        Err(e) => {
            report_unavailable(&inner, &tx, e).await;
            return;
        }
    };

    loop {
        let received = tokio::select! {
            _ = inner.stop.cancelled() => break,
            received = conn.channel.receive(&queue, inner.config.receive_wait) => received,
        };

        match received {
            Ok(None) => {}
            Ok(Some(delivery)) => {
                let Some(inbound) = inner.decode(&conn, &queue, delivery).await else {
                    continue;
                };
                tokio::select! {
                    _ = inner.stop.cancelled() => break,
                    sent = tx.send(Ok(inbound)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) if e.is_connection() => {
                warn!(queue = %queue, generation = conn.generation, error = %e, "broker connection lost; reconnecting");
                match inner.link.replace(Some(conn.generation)).await {
                    Ok(next) => conn = next,
                    Err(e) => {
                        report_unavailable(&inner, &tx, e).await;
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "receive failed");
                tokio::select! {
                    _ = inner.stop.cancelled() => break,
                    _ = tokio::time::sleep(inner.config.reconnect.base_delay) => {}
                }
            }
        }
    }
    debug!(queue = %queue, "receive loop stopped");
}

/// Hands the fatal error to the stream unless the connector is already stopping.
async fn report_unavailable(inner: &Inner, tx: &mpsc::Sender<Result<Inbound, BrokerError>>, error: BrokerError) {
    tokio::select! {
        _ = inner.stop.cancelled() => {}
        _ = tx.send(Err(error)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryBroker;
    use crate::ports::SystemClock;

    fn config() -> ConnectorConfig {
        let mut config = ConnectorConfig::new("tasks");
        config.declare = vec!["results".into()];
        config.prefetch = 4;
        config.receive_wait = Duration::from_millis(50);
        config.reconnect = RetryPolicy::new(Duration::from_millis(10), 2.0, Duration::from_millis(100));
        config.max_reconnect_attempts = 3;
        config
    }

    fn connector(broker: &InMemoryBroker, config: ConnectorConfig) -> (BrokerConnector, Arc<DispatchCounters>) {
        let counters = Arc::new(DispatchCounters::new());
        let connector = BrokerConnector::new(
            Arc::new(broker.clone()),
            config,
            Arc::new(SystemClock),
            Arc::clone(&counters),
        );
        (connector, counters)
    }

    fn task_bytes(id: &str) -> Vec<u8> {
        codec::encode_task(&Task::new(id, "echo", b"x".to_vec())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn streams_decoded_tasks_and_acks() {
        let broker = InMemoryBroker::new();
        broker.enqueue("tasks", task_bytes("t1"));
        let (connector, _) = connector(&broker, config());

        let mut stream = connector.start().await.unwrap();
        let inbound = stream.next().await.unwrap().unwrap();

        assert_eq!(inbound.task.id().as_str(), "t1");
        assert_eq!(inbound.receipt.task_id(), inbound.task.id());
        assert_eq!(connector.ack(&inbound.receipt).await.unwrap(), Settlement::Settled);
        assert_eq!(broker.acked(), vec![inbound.receipt.tag()]);
        connector.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn poison_is_dropped_and_stream_continues() {
        let broker = InMemoryBroker::new();
        broker.enqueue("tasks", b"garbage".to_vec());
        broker.enqueue("tasks", task_bytes("t2"));
        let (connector, counters) = connector(&broker, config());

        let mut stream = connector.start().await.unwrap();
        let inbound = stream.next().await.unwrap().unwrap();

        assert_eq!(inbound.task.id().as_str(), "t2");
        assert_eq!(broker.dead_lettered("tasks"), vec![b"garbage".to_vec()]);
        assert_eq!(counters.snapshot().poison, 1);
        connector.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn task_without_id_gets_a_generated_one() {
        let broker = InMemoryBroker::new();
        broker.enqueue("tasks", task_bytes(""));
        broker.enqueue("tasks", task_bytes("t2"));
        let (connector, counters) = connector(&broker, config());

        let mut stream = connector.start().await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();

        assert!(first.task.id().as_str().starts_with("task-"));
        assert_eq!(first.receipt.task_id(), first.task.id());
        assert_eq!(second.task.id().as_str(), "t2");
        assert_eq!(counters.snapshot().poison, 0);
        assert!(broker.dead_lettered("tasks").is_empty());
        connector.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_and_skips_stale_acks() {
        let broker = InMemoryBroker::new();
        broker.enqueue("tasks", task_bytes("t1"));
        let (connector, counters) = connector(&broker, config());
        let mut stream = connector.start().await.unwrap();
        let first = stream.next().await.unwrap().unwrap();

        broker.fail_next_connects(1);
        broker.disconnect();

        // 未 ack の t1 が新しい接続で再配送される
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.task.id().as_str(), "t1");
        assert!(again.receipt.redelivered());
        assert!(again.receipt.generation() > first.receipt.generation());

        assert_eq!(connector.ack(&first.receipt).await.unwrap(), Settlement::Stale);
        assert_eq!(connector.ack(&again.receipt).await.unwrap(), Settlement::Settled);
        assert_eq!(broker.acked().len(), 1);
        assert_eq!(counters.snapshot().reconnects, 1);
        connector.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_end_the_stream() {
        let broker = InMemoryBroker::new();
        let (connector, _) = connector(&broker, config());
        let mut stream = connector.start().await.unwrap();

        broker.set_down(true);

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable { attempts: 3, .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn initial_connect_fails_after_cap() {
        let broker = InMemoryBroker::new();
        broker.set_down(true);
        let (connector, _) = connector(&broker, config());

        assert!(matches!(
            connector.start().await,
            Err(BrokerError::Unavailable { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn full_channel_stops_receiving() {
        let broker = InMemoryBroker::new();
        for i in 0..6 {
            broker.enqueue("tasks", task_bytes(&format!("t{i}")));
        }
        let mut cfg = config();
        cfg.prefetch = 1;
        let (connector, _) = connector(&broker, cfg);

        let _stream = connector.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // 1 件は channel の中、1 件は send 待ち
        assert_eq!(broker.unacked(), 2);
        assert_eq!(broker.depth("tasks"), 4);
        connector.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn publish_survives_a_dropped_connection() {
        let broker = InMemoryBroker::new();
        let (connector, _) = connector(&broker, config());
        let _stream = connector.start().await.unwrap();

        broker.disconnect();
        connector
            .publish("results", b"r".to_vec(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(broker.published("results"), vec![b"r".to_vec()]);
        connector.close().await;
    }
    fn node_config(node: &str) -> ConnectorConfig {
        let mut config = config();
        config.node_queue = Some(node_queue(node));
        config.broadcast_exchange = Some("broadcast".into());
        config
    }

    #[tokio::test(start_paused = true)]
    async fn node_queue_is_consumed_and_settled_on_its_own_queue() {
        let broker = InMemoryBroker::new();
        broker.enqueue("node.a", task_bytes("direct"));
        let (connector, _) = connector(&broker, node_config("a"));

        let mut stream = connector.start().await.unwrap();
        let inbound = stream.next().await.unwrap().unwrap();

        assert_eq!(inbound.task.id().as_str(), "direct");
        assert_eq!(inbound.receipt.queue(), "node.a");
        assert_eq!(connector.ack(&inbound.receipt).await.unwrap(), Settlement::Settled);
        assert_eq!(broker.unacked(), 0);
        assert_eq!(broker.bound("broadcast"), vec!["node.a".to_string()]);
        connector.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn routes_reach_the_right_queues() {
        let broker = InMemoryBroker::new();
        let (a, _) = connector(&broker, node_config("a"));
        let (b, _) = connector(&broker, node_config("b"));
        let _stream_a = a.start().await.unwrap();
        let _stream_b = b.start().await.unwrap();
        a.stop_receiving();
        b.stop_receiving();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(a.route(&Route::Any, task_bytes("any")).await.unwrap(), 1);
        assert_eq!(a.route(&Route::node("b"), task_bytes("to-b")).await.unwrap(), 1);
        assert_eq!(a.route(&Route::Broadcast, task_bytes("all")).await.unwrap(), 2);

        assert_eq!(broker.depth("tasks"), 1);
        assert_eq!(broker.depth("node.a"), 1);
        assert_eq!(broker.depth("node.b"), 2);
        a.close().await;
        b.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_without_exchange_is_an_error() {
        let broker = InMemoryBroker::new();
        let (connector, _) = connector(&broker, config());

        let err = connector.route(&Route::Broadcast, task_bytes("all")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Operation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn replies_are_decoded_and_acked() {
        let broker = InMemoryBroker::new();
        let report = OutcomeReport::from_outcome(
            &Task::new("t1", "echo", Vec::new()),
            &crate::domain::Outcome::success(b"done".to_vec()),
        );
        broker.enqueue("node.a.replies", b"junk".to_vec());
        broker.enqueue("node.a.replies", codec::encode_outcome(&report).unwrap());
        let (connector, counters) = connector(&broker, config());

        let wait = Duration::from_millis(10);
        assert_eq!(connector.next_reply("node.a.replies", wait).await.unwrap(), None);
        assert_eq!(connector.next_reply("node.a.replies", wait).await.unwrap(), Some(report));
        assert_eq!(connector.next_reply("node.a.replies", wait).await.unwrap(), None);
        assert_eq!(counters.snapshot().poison, 1);
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connector_refuses_to_publish() {
        let broker = InMemoryBroker::new();
        let (connector, _) = connector(&broker, config());
        let _stream = connector.start().await.unwrap();
        connector.close().await;

        let err = connector
            .publish("results", b"r".to_vec(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
        assert!(matches!(connector.start().await, Err(BrokerError::Closed)));
        assert_eq!(broker.connects(), 1);
    }
}
