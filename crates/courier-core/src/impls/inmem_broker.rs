//! InMemoryBroker - 開発・テスト用の broker
//!
//! # 学習ポイント
//! - std Mutex（await を跨がない短いクリティカルセクション）+ tokio Notify による待機
//! - 接続の世代（generation）で「切断済みチャネル」を表現する
//! - 切断時に未 ack のメッセージを先頭に戻す（redelivered = true）
//!
//! # Fault injection
//! - `disconnect()`: 現在の接続を切る。未 ack のメッセージは再配送される
//! - `fail_next_connects(n)`: 次の n 回の接続を失敗させる
//! - `set_down(true)`: 復旧するまで接続を拒否する

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::ports::{Broker, BrokerChannel, BrokerError, Delivery, DeliveryTag};

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Pending {
    queue: String,
    message: Message,
}

/// Everything the broker has been asked to do, for assertions.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    pub published: Vec<(String, Vec<u8>)>,
    pub acked: Vec<DeliveryTag>,
    pub nacked: Vec<(DeliveryTag, bool)>,
    pub dead_lettered: Vec<(String, Vec<u8>)>,
    pub broadcast: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<Message>>,
    /// exchange → bound queues
    bindings: HashMap<String, BTreeSet<String>>,
    unacked: HashMap<u64, Pending>,
    next_tag: u64,
    generation: u64,
    down: bool,
    failing_connects: u32,
    connects: u32,
    journal: Journal,
}

impl State {
    fn check(&self, generation: u64) -> Result<(), BrokerError> {
        if self.down || self.generation != generation {
            return Err(BrokerError::ConnectionLost("channel closed by broker".into()));
        }
        Ok(())
    }

    fn push(&mut self, queue: &str, body: Vec<u8>) {
        self.queues.entry(queue.to_string()).or_default().push_back(Message {
            body,
            redelivered: false,
        });
    }

    /// 未 ack のメッセージを tag 順に各キューの先頭へ戻す
    fn requeue_unacked(&mut self) {
        let mut pending: Vec<(u64, Pending)> = self.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        for (_, Pending { queue, mut message }) in pending.into_iter().rev() {
            message.redelivered = true;
            self.queues.entry(queue).or_default().push_front(message);
        }
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker. Clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Producer side: appends a message without going through a channel.
    pub fn enqueue(&self, queue: &str, body: Vec<u8>) {
        self.shared.lock().push(queue, body);
        self.shared.notify.notify_waiters();
    }

    /// Drops the current connection. Unacked messages go back to the front of their queues.
    pub fn disconnect(&self) {
        {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.requeue_unacked();
        }
        self.shared.notify.notify_waiters();
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.shared.lock().failing_connects = count;
    }

    /// While down, every connect fails. Going down also drops the current connection.
    pub fn set_down(&self, down: bool) {
        self.shared.lock().down = down;
        if down {
            self.disconnect();
        }
    }

    pub fn journal(&self) -> Journal {
        self.shared.lock().journal.clone()
    }

    /// Bodies published to `topic` through a channel, in order.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .journal
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn acked(&self) -> Vec<DeliveryTag> {
        self.shared.lock().journal.acked.clone()
    }

    pub fn dead_lettered(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .journal
            .dead_lettered
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Queues bound to `exchange`, in name order.
    pub fn bound(&self, exchange: &str) -> Vec<String> {
        self.shared
            .lock()
            .bindings
            .get(exchange)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages waiting in `queue` (not counting unacked deliveries).
    pub fn depth(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Delivered but not yet acked or nacked.
    pub fn unacked(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    /// Successful connects so far.
    pub fn connects(&self) -> u32 {
        self.shared.lock().connects
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.shared.lock();
        if state.down {
            return Err(BrokerError::ConnectionLost("broker is down".into()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::ConnectionLost("connection refused".into()));
        }
        state.connects += 1;
        Ok(Arc::new(InMemoryChannel {
            shared: Arc::clone(&self.shared),
            generation: state.generation,
            closed: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct InMemoryChannel {
    shared: Arc<Shared>,
    generation: u64,
    closed: AtomicBool,
}

impl InMemoryChannel {
    /// broker 側で切れたチャネルは `ConnectionLost`、自分で close したものは `Closed`
    fn check(&self, state: &State) -> Result<(), BrokerError> {
        state.check(self.generation)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.check(&state)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            // lost wakeup を避けるため、状態を見る前に通知を登録する
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                self.check(&state)?;
                if let Some(message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let delivery = Delivery {
                        tag: DeliveryTag(tag),
                        body: message.body.clone(),
                        redelivered: message.redelivered,
                    };
                    state.unacked.insert(
                        tag,
                        Pending {
                            queue: queue.to_string(),
                            message,
                        },
                    );
                    return Ok(Some(delivery));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn publish(&self, topic: &str, body: Vec<u8>, delay: Duration) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.lock();
            self.check(&state)?;
            state.journal.published.push((topic.to_string(), body.clone()));
            if delay.is_zero() {
                state.push(topic, body);
                drop(state);
                self.shared.notify.notify_waiters();
                return Ok(());
            }
        }

        // 遅延配送: broker 側で保持し、delay 経過後に可視になる
        let shared = Arc::clone(&self.shared);
        let topic = topic.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.lock().push(&topic, body);
            shared.notify.notify_waiters();
        });
        Ok(())
    }

    async fn bind(&self, exchange: &str, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.check(&state)?;
        state.queues.entry(queue.to_string()).or_default();
        state
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn broadcast(&self, exchange: &str, body: Vec<u8>) -> Result<usize, BrokerError> {
        let delivered = {
            let mut state = self.shared.lock();
            self.check(&state)?;
            state.journal.broadcast.push((exchange.to_string(), body.clone()));
            let queues: Vec<String> = state
                .bindings
                .get(exchange)
                .map(|queues| queues.iter().cloned().collect())
                .unwrap_or_default();
            for queue in &queues {
                state.push(queue, body.clone());
            }
            queues.len()
        };
        self.shared.notify.notify_waiters();
        Ok(delivered)
    }

    async fn ack(&self, _queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.check(&state)?;
        if state.unacked.remove(&tag.0).is_none() {
            return Err(BrokerError::Operation(format!("unknown delivery tag {tag}")));
        }
        state.journal.acked.push(tag);
        Ok(())
    }

    async fn nack(&self, _queue: &str, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.check(&state)?;
        let Some(Pending { queue, mut message }) = state.unacked.remove(&tag.0) else {
            return Err(BrokerError::Operation(format!("unknown delivery tag {tag}")));
        };
        state.journal.nacked.push((tag, requeue));
        if requeue {
            message.redelivered = true;
            state.queues.entry(queue).or_default().push_front(message);
            drop(state);
            self.shared.notify.notify_waiters();
        } else {
            state.journal.dead_lettered.push((queue, message.body));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
