//! Dispatcher - 受信 → 解決 → 実行 → 判定 → ack のループ
//!
//! # 学習ポイント
//! - slot を確保してから stream を読む（pool が埋まっている間は次を取らない）
//! - 1 タスク = 1 tokio task（JoinSet で追跡し、shutdown 時に drain）
//! - `timeout` + oneshot で遅れて届いた結果を捨てる
//! - 副作用（publish → ack）の順序: publish に失敗したら ack しない
//!
//! # フロー
//! 1. `pool.reserve()` で global slot を確保
//! 2. `stream.next()` で decode 済みタスクを受け取る
//! 3. registry で module を解決（未登録なら Rejected, requeue なしで nack）
//! 4. module slot を確保して実行、timeout まで結果を待つ
//! 5. Decider の判定に従って publish / republish し、元の delivery を ack
//!
//! module の start は依存先から順に、stop はその逆順に呼ぶ（registry の並び順）。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, Span, debug, error, info, warn};

use super::connector::{BrokerConnector, Inbound, Receipt, Settlement, TaskStream};
use super::pool::{Reservation, WorkerPool};
use super::status::{DispatchCounters, DispatchCounts};
use crate::codec;
use crate::domain::metadata::keys;
use crate::domain::{Decider, Decision, Metadata, Outcome, OutcomeReport, Task, TaskState};
use crate::error::{CourierError, Result};
use crate::module::{ModuleRegistry, RegisteredModule, TaskContext};
use crate::ports::Clock;
use crate::telemetry;

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Global worker slots.
    pub concurrency: usize,
    /// Used for modules without their own timeout.
    pub task_timeout: Duration,
    /// Destination for success outcomes when the task has no `reply-to`.
    pub result_topic: Option<String>,
    pub error_topic: String,
    /// Stamped as `origin` on published outcomes.
    pub node_id: String,
    pub shutdown_grace: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            concurrency: 8,
            task_timeout: Duration::from_secs(30),
            result_topic: Some("results".to_string()),
            error_topic: "errors".to_string(),
            node_id: "courier".to_string(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Per-task state, recorded on the task's span.
struct Lifecycle {
    span: Span,
    state: TaskState,
}

impl Lifecycle {
    fn new(span: Span) -> Self {
        span.record("task.state", TaskState::Received.as_str());
        Self {
            span,
            state: TaskState::Received,
        }
    }

    fn advance(&mut self, next: TaskState) {
        if !self.state.can_transition_to(next) {
            self.span.in_scope(|| {
                warn!(from = self.state.as_str(), to = next.as_str(), "unexpected state transition");
            });
        }
        telemetry::record_state_transition(&self.span, self.state, next);
        self.state = next;
    }
}

struct Shared {
    registry: ModuleRegistry,
    pool: WorkerPool,
    connector: BrokerConnector,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    counters: Arc<DispatchCounters>,
    policy: DispatchPolicy,
}

/// The dispatch engine. Clones share the same state.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(
        registry: ModuleRegistry,
        connector: BrokerConnector,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
        counters: Arc<DispatchCounters>,
        policy: DispatchPolicy,
    ) -> Self {
        let pool = WorkerPool::for_registry(policy.concurrency, &registry);
        Self {
            shared: Arc::new(Shared {
                registry,
                pool,
                connector,
                decider,
                clock,
                counters,
                policy,
            }),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.shared.policy
    }

    pub fn counts(&self) -> DispatchCounts {
        self.shared.counters.snapshot()
    }

    /// Runs until `shutdown` fires or the broker becomes unavailable.
    ///
    /// Module `start` hooks run first; on return in-flight tasks have been
    /// drained (up to the grace period) and `stop` hooks have run.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<DispatchCounts> {
        self.start_modules().await?;

        let mut stream = match self.shared.connector.start().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "could not connect to broker");
                self.stop_modules().await;
                return Err(e.into());
            }
        };
        info!(
            queue = self.shared.connector.input_queue(),
            concurrency = self.shared.pool.limit(),
            modules = self.shared.registry.len(),
            "dispatcher started"
        );

        let mut flows = JoinSet::new();
        let result = self.consume(&mut stream, &mut flows, &shutdown).await;

        self.drain(&mut flows).await;
        self.stop_modules().await;
        self.shared.pool.close();
        self.shared.connector.close().await;

        let counts = self.counts();
        info!(
            received = counts.received,
            completed = counts.completed,
            failed = counts.failed,
            retried = counts.retried,
            timed_out = counts.timed_out,
            rejected = counts.rejected,
            poison = counts.poison,
            reconnects = counts.reconnects,
            "dispatcher stopped"
        );
        result.map(|()| counts)
    }

    async fn consume(
        &self,
        stream: &mut TaskStream,
        flows: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            while let Some(joined) = flows.try_join_next() {
                log_join(joined);
            }

            let reservation = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                reservation = self.shared.pool.reserve() => match reservation {
                    Some(reservation) => reservation,
                    None => return Ok(()),
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(inbound)) => self.accept(inbound, reservation, flows).await,
                Some(Err(e)) => {
                    error!(error = %e, "broker unavailable; stopping dispatcher");
                    return Err(e.into());
                }
                None => return Ok(()),
            }
        }
    }

    /// Resolves the module and spawns the task's flow.
    async fn accept(&self, inbound: Inbound, reservation: Reservation, flows: &mut JoinSet<()>) {
        let Inbound { task, receipt } = inbound;
        self.shared.counters.record_received();

        let span = telemetry::task_span(&task);
        let mut lifecycle = Lifecycle::new(span.clone());
        lifecycle.advance(TaskState::Resolving);

        let module = match self.shared.registry.resolve(task.task_type().as_str()) {
            Ok(module) => module,
            Err(e) => {
                drop(reservation);
                lifecycle.advance(TaskState::Rejected);
                span.in_scope(|| warn!(error = %e, "no module registered for task type; dropping"));
                self.shared.counters.record_rejected();
                if let Err(e) = self.shared.connector.nack(&receipt, false).await {
                    span.in_scope(|| warn!(error = %e, "failed to drop rejected task"));
                }
                return;
            }
        };

        lifecycle.advance(TaskState::Dispatched);
        if receipt.redelivered() {
            span.in_scope(|| debug!(delivery.tag = %receipt.tag(), "redelivered task"));
        }
        let this = self.clone();
        flows.spawn(
            async move { this.dispatch(task, receipt, module, reservation, lifecycle).await }.instrument(span),
        );
    }

    async fn dispatch(
        &self,
        task: Task,
        receipt: Receipt,
        module: Arc<RegisteredModule>,
        reservation: Reservation,
        mut lifecycle: Lifecycle,
    ) {
        let Some(outcome) = self.execute(&task, &module, reservation, &mut lifecycle).await else {
            warn!("worker pool closed before the task started; leaving it to broker redelivery");
            return;
        };
        if matches!(outcome, Outcome::Timeout) {
            self.shared.counters.record_timed_out();
        }

        let decision = self.shared.decider.decide(&task, module.capabilities(), &outcome);
        self.settle(&task, &receipt, &outcome, decision, &mut lifecycle).await;
    }

    /// Runs the module under its timeout. `None` if the pool closed first.
    async fn execute(
        &self,
        task: &Task,
        module: &RegisteredModule,
        reservation: Reservation,
        lifecycle: &mut Lifecycle,
    ) -> Option<Outcome> {
        let shared = &self.shared;
        let mut limit = module.timeout().unwrap_or(shared.policy.task_timeout);

        if let Some(deadline) = task.metadata().deadline() {
            match (deadline - shared.clock.now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => limit = limit.min(remaining),
                _ => {
                    drop(reservation);
                    lifecycle.advance(TaskState::TimedOut);
                    warn!(%deadline, "deadline passed before execution");
                    return Some(Outcome::Timeout);
                }
            }
        }

        let slot = shared.pool.admit(reservation, module.identifier()).await?;
        lifecycle.advance(TaskState::Executing);

        let cancel = CancellationToken::new();
        let (ctx, report) = TaskContext::new(task.clone(), cancel.clone());
        let handler = Arc::clone(module.module());
        let span = lifecycle.span.clone();

        let execution = if module.capabilities().synchronous {
            let runtime = tokio::runtime::Handle::current();
            shared.pool.spawn_blocking(slot, move || {
                let _entered = span.enter();
                let result = runtime.block_on(handler.execute(&ctx));
                ctx.finish(result);
            })
        } else {
            shared.pool.spawn(
                slot,
                async move {
                    let result = handler.execute(&ctx).await;
                    ctx.finish(result);
                }
                .instrument(span),
            )
        };

        let outcome = match tokio::time::timeout(limit, report).await {
            Ok(Ok(outcome)) => outcome,
            // 報告なしで sender が落ちた = panic
            Ok(Err(_)) => match execution.join().await {
                Err(panic) => {
                    error!(error = %panic, "module panicked");
                    Outcome::failure(format!("module panicked: {}", panic.0), false)
                }
                Ok(()) => Outcome::failure("module finished without reporting an outcome", false),
            },
            Err(_) => {
                cancel.cancel();
                warn!(timeout_ms = limit.as_millis() as u64, "task timed out; cancelling");
                Outcome::Timeout
            }
        };

        lifecycle.advance(match &outcome {
            Outcome::Success { .. } => TaskState::Completed,
            Outcome::Failure { .. } => TaskState::Failed,
            Outcome::Timeout => TaskState::TimedOut,
        });
        Some(outcome)
    }

    /// Publishes whatever the decision requires, then acks the original delivery.
    async fn settle(
        &self,
        task: &Task,
        receipt: &Receipt,
        outcome: &Outcome,
        decision: Decision,
        lifecycle: &mut Lifecycle,
    ) {
        let counters = &self.shared.counters;
        let published = match &decision {
            Decision::Complete => self.publish_result(task, outcome).await,
            Decision::Retry {
                delay,
                retry_count,
                reason,
            } => {
                info!(retry_count, delay_ms = delay.as_millis() as u64, reason = %reason, "scheduling retry");
                self.republish(task, receipt.queue(), *delay).await
            }
            Decision::GiveUp { reason } => {
                warn!(status = outcome.status().as_str(), reason = %reason, "giving up on task");
                self.publish_failure(task, outcome).await
            }
        };

        if let Err(e) = published {
            error!(error = %e, "publish failed; leaving delivery unacked for redelivery");
            return;
        }
        match decision {
            Decision::Complete => counters.record_completed(),
            Decision::Retry { .. } => counters.record_retried(),
            Decision::GiveUp { .. } => counters.record_failed(),
        }

        match self.shared.connector.ack(receipt).await {
            Ok(Settlement::Settled) => lifecycle.advance(TaskState::Acked),
            Ok(Settlement::Stale) => debug!("ack skipped for a replaced connection"),
            Err(e) => warn!(error = %e, "ack failed"),
        }
    }

    async fn publish_result(&self, task: &Task, outcome: &Outcome) -> Result<()> {
        let policy = &self.shared.policy;
        let topic = task
            .metadata()
            .reply_to()
            .map(str::to_string)
            .or_else(|| policy.result_topic.clone());
        let Some(topic) = topic else {
            return Ok(());
        };

        let report = OutcomeReport::from_outcome(task, outcome).with_origin(&policy.node_id);
        match codec::encode_outcome(&report) {
            Ok(bytes) => {
                self.shared.connector.publish(&topic, bytes, Duration::ZERO).await?;
                debug!(topic = %topic, "result published");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "result could not be encoded; reporting failure instead");
                let fallback = Outcome::failure(format!("result could not be encoded: {e}"), false);
                self.publish_failure(task, &fallback).await
            }
        }
    }

    async fn publish_failure(&self, task: &Task, outcome: &Outcome) -> Result<()> {
        let policy = &self.shared.policy;
        let report = OutcomeReport::from_outcome(task, outcome).with_origin(&policy.node_id);
        let bytes = match codec::encode_outcome(&report) {
            Ok(bytes) => bytes,
            Err(e) => {
                // metadata が大きすぎる場合など。origin だけ残して送る
                warn!(error = %e, "failure report too large; dropping task metadata");
                let mut minimal = report;
                minimal.metadata = Metadata::new().with(keys::ORIGIN, policy.node_id.as_str());
                codec::encode_outcome(&minimal)?
            }
        };
        self.shared
            .connector
            .publish(&policy.error_topic, bytes, Duration::ZERO)
            .await?;
        Ok(())
    }

    /// Sends the retry back to the queue the task arrived on, so node-targeted
    /// and broadcast tasks stay on this node.
    async fn republish(&self, task: &Task, queue: &str, delay: Duration) -> Result<()> {
        let bytes = codec::encode_task(&task.retried())?;
        self.shared
            .connector
            .publish(queue, bytes, delay)
            .await
            .map_err(CourierError::from)
    }

    /// Stops receiving and waits for running flows, up to the grace period.
    async fn drain(&self, flows: &mut JoinSet<()>) {
        self.shared.connector.stop_receiving();
        if flows.is_empty() {
            return;
        }

        let grace = self.shared.policy.shutdown_grace;
        info!(in_flight = flows.len(), grace_ms = grace.as_millis() as u64, "draining in-flight tasks");
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = flows.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(abandoned = flows.len(), "shutdown grace elapsed; unacked tasks will be redelivered");
            flows.abort_all();
        }
    }

    async fn start_modules(&self) -> Result<()> {
        let modules: Vec<_> = self.shared.registry.modules().cloned().collect();
        for (started, module) in modules.iter().enumerate() {
            if let Err(source) = module.module().start().await {
                error!(module = %module.identifier(), error = %source, "module failed to start");
                for module in modules[..started].iter().rev() {
                    stop_module(module).await;
                }
                return Err(CourierError::Lifecycle {
                    identifier: module.identifier().clone(),
                    phase: "start",
                    source,
                });
            }
            debug!(module = %module.identifier(), "module started");
        }
        Ok(())
    }

    async fn stop_modules(&self) {
        let modules: Vec<_> = self.shared.registry.modules().cloned().collect();
        for module in modules.iter().rev() {
            stop_module(module).await;
        }
    }
}

async fn stop_module(module: &RegisteredModule) {
    match module.module().stop().await {
        Ok(()) => debug!(module = %module.identifier(), "module stopped"),
        Err(e) => warn!(module = %module.identifier(), error = %e, "module failed to stop"),
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "dispatch flow panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::connector::ConnectorConfig;
    use crate::domain::{DefaultDecider, ExecutionError, OutcomeStatus, RetryPolicy};
    use crate::impls::InMemoryBroker;
    use crate::module::{Module, ModuleEntry};
    use crate::ports::FixedClock;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Module for Counting {
        async fn execute(&self, ctx: &TaskContext) -> std::result::Result<(), ExecutionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.succeed(ctx.payload().to_vec());
            Ok(())
        }
    }

    struct FailsToStart;

    #[async_trait]
    impl Module for FailsToStart {
        async fn execute(&self, _ctx: &TaskContext) -> std::result::Result<(), ExecutionError> {
            Ok(())
        }

        async fn start(&self) -> std::result::Result<(), ExecutionError> {
            Err(ExecutionError::permanent("missing credentials"))
        }
    }

    struct Lifecycle {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Module for Lifecycle {
        async fn execute(&self, _ctx: &TaskContext) -> std::result::Result<(), ExecutionError> {
            Ok(())
        }

        async fn start(&self) -> std::result::Result<(), ExecutionError> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&self) -> std::result::Result<(), ExecutionError> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    fn lifecycle(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> ModuleEntry {
        let log = Arc::clone(log);
        ModuleEntry::new(name, move || {
            Arc::new(Lifecycle {
                name,
                log: Arc::clone(&log),
            }) as Arc<dyn Module>
        })
    }

    fn dispatcher(broker: &InMemoryBroker, registry: ModuleRegistry, clock: Arc<dyn Clock>) -> Dispatcher {
        let counters = Arc::new(DispatchCounters::new());
        let mut config = ConnectorConfig::new("tasks");
        config.declare = vec!["results".into(), "errors".into()];
        config.receive_wait = Duration::from_millis(50);
        config.reconnect = RetryPolicy::new(Duration::from_millis(10), 2.0, Duration::from_millis(50));
        config.max_reconnect_attempts = 2;
        let connector = BrokerConnector::new(
            Arc::new(broker.clone()),
            config,
            Arc::clone(&clock),
            Arc::clone(&counters),
        );
        Dispatcher::new(
            registry,
            connector,
            Arc::new(DefaultDecider::default()),
            clock,
            counters,
            DispatchPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_skips_execution() {
        let runs = Arc::new(AtomicUsize::new(0));
        let module_runs = Arc::clone(&runs);
        let registry = ModuleRegistry::from_entries([ModuleEntry::new("count", move || {
            Arc::new(Counting {
                runs: Arc::clone(&module_runs),
            }) as Arc<dyn Module>
        })
        .with_concurrency_limit(1)])
        .unwrap();

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(now));
        let expired = now.timestamp_millis() - 1_000;
        let task = Task::new("late", "count", b"x".to_vec())
            .with_metadata(Metadata::new().with(keys::DEADLINE, expired).with(keys::RETRY_COUNT, 3_i64));

        let broker = InMemoryBroker::new();
        broker.enqueue("tasks", codec::encode_task(&task).unwrap());
        let dispatcher = dispatcher(&broker, registry, clock);

        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });
        while broker.published("errors").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        let counts = run.await.unwrap().unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        let report = codec::decode_outcome(&broker.published("errors")[0]).unwrap();
        assert_eq!(report.status, OutcomeStatus::Timeout);
        assert_eq!(counts.timed_out, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(broker.acked().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn modules_start_after_their_dependencies_and_stop_before_them() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ModuleRegistry::from_entries([
            lifecycle("thumbnail", &log).depends_on(["resize", "storage"]),
            lifecycle("resize", &log).depends_on(["storage"]),
            lifecycle("storage", &log),
        ])
        .unwrap();
        let broker = InMemoryBroker::new();
        let dispatcher = dispatcher(&broker, registry, Arc::new(crate::ports::SystemClock));

        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });
        while broker.connects() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            [
                "start storage",
                "start resize",
                "start thumbnail",
                "stop thumbnail",
                "stop resize",
                "stop storage",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_aborts_before_consuming() {
        let broker = InMemoryBroker::new();
        broker.enqueue("tasks", codec::encode_task(&Task::new("t1", "broken", b"".to_vec())).unwrap());
        let registry = ModuleRegistry::from_entries([ModuleEntry::new("broken", || {
            Arc::new(FailsToStart) as Arc<dyn Module>
        })])
        .unwrap();
        let dispatcher = dispatcher(&broker, registry, Arc::new(crate::ports::SystemClock));

        let err = dispatcher.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, CourierError::Lifecycle { phase: "start", .. }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(broker.depth("tasks"), 1);
        assert_eq!(broker.connects(), 0);
    }
}
