//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 重複登録・期待モジュールの欠落・設定の上書き先の欠落
//! - 設定値から broker / decider / pool を組み立てる
//! - module の依存関係（未登録・循環）も `build()` で検出する

use std::sync::Arc;
use std::time::Duration;

use super::connector::BrokerConnector;
use super::dispatcher::{DispatchPolicy, Dispatcher};
use super::status::{DispatchCounters, DispatchCounts};
use crate::codec;
use crate::config::{BrokerKind, Config, ConfigError};
use crate::domain::route::reply_queue;
use crate::domain::metadata::keys;
use crate::domain::{Decider, OutcomeReport, Route, Task, TaskId};
use crate::error::{CourierError, Result};
use crate::impls::InMemoryBroker;
use crate::module::{ModuleEntry, ModuleRegistry, RegistryBuilder, RegistryError};
use crate::ports::{Broker, Clock, SystemClock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register_all(modules::discover())?
///     .expect_tasks(&["echo"])
///     .config(config)
///     .build()?;
/// app.run(shutdown).await?;
/// ```
///
/// # Fail-fast 設計
/// - `register()` は重複や不正な identifier をその場で弾く
/// - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 設定の `[modules.*]` が未登録モジュールを指していたらエラー
pub struct AppBuilder {
    registry: RegistryBuilder,
    expected_tasks: Option<Vec<String>>,
    config: Config,
    broker: Option<Arc<dyn Broker>>,
    clock: Arc<dyn Clock>,
    decider: Option<Arc<dyn Decider>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: RegistryBuilder::new(),
            expected_tasks: None,
            config: Config::default(),
            broker: None,
            clock: Arc::new(SystemClock),
            decider: None,
        }
    }

    pub fn register(mut self, entry: ModuleEntry) -> Result<Self, RegistryError> {
        self.registry.register(entry)?;
        Ok(self)
    }

    pub fn register_all(mut self, entries: impl IntoIterator<Item = ModuleEntry>) -> Result<Self, RegistryError> {
        self.registry.register_all(entries)?;
        Ok(self)
    }

    /// Task types that must be registered by `build()`.
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Uses `broker` instead of the one named by the configuration.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the retry-count decider built from `[retry]`.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn build(mut self) -> Result<App> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(RegistryError::MissingModules(missing).into());
            }
        }

        self.config.validate()?;
        for (identifier, limits) in &self.config.modules {
            self.registry
                .override_limits(identifier, limits.concurrency, limits.timeout())?;
        }

        let registry = self.registry.freeze()?;
        let longest = registry
            .modules()
            .filter_map(|m| m.timeout())
            .fold(Duration::from_millis(self.config.workers.task_timeout_ms), Duration::max);
        self.config.check_visibility_timeout(longest)?;

        let broker = match self.broker.take() {
            Some(broker) => broker,
            None => broker_from_config(&self.config)?,
        };
        let decider = self
            .decider
            .take()
            .unwrap_or_else(|| Arc::new(self.config.decider()));

        let counters = Arc::new(DispatchCounters::new());
        let connector = BrokerConnector::new(
            broker,
            self.config.connector_config(),
            Arc::clone(&self.clock),
            Arc::clone(&counters),
        );
        let dispatcher = Dispatcher::new(
            registry.clone(),
            connector.clone(),
            decider,
            self.clock,
            Arc::clone(&counters),
            self.config.dispatch_policy(),
        );

        Ok(App {
            registry,
            dispatcher,
            connector,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn broker_from_config(config: &Config) -> Result<Arc<dyn Broker>, ConfigError> {
    match config.broker.kind {
        BrokerKind::Memory => Ok(Arc::new(InMemoryBroker::new())),
        #[cfg(feature = "pgmq")]
        BrokerKind::Pgmq => {
            use secrecy::{ExposeSecret as _, SecretString};

            let url = config.broker.url.expose_secret();
            if url.is_empty() {
                return Err(ConfigError::Invalid(
                    "broker.url is required for the pgmq broker".into(),
                ));
            }
            let broker = crate::impls::PgmqBroker::new(SecretString::from(url.to_string()))
                .with_max_connections(config.broker.max_connections)
                .with_poll_interval(Duration::from_millis(config.broker.poll_interval_ms))
                .with_visibility_timeout(Duration::from_secs(config.broker.visibility_timeout_secs));
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "pgmq"))]
        BrokerKind::Pgmq => Err(ConfigError::Invalid(
            "courier-core was built without the `pgmq` feature".into(),
        )),
    }
}

/// The assembled engine.
pub struct App {
    registry: ModuleRegistry,
    dispatcher: Dispatcher,
    connector: BrokerConnector,
}

impl App {
    /// Runs the dispatcher until `shutdown` fires or the broker is lost.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<DispatchCounts> {
        self.dispatcher.run(shutdown).await
    }

    /// Encodes `task` and publishes it to the input queue.
    pub async fn submit(&self, task: &Task) -> Result<()> {
        self.submit_to(task, &Route::Any).await.map(|_| ())
    }

    /// Encodes `task` and publishes it along `route`. Returns how many queues received it.
    pub async fn submit_to(&self, task: &Task, route: &Route) -> Result<usize> {
        let bytes = codec::encode_task(task)?;
        let delivered = self.connector.route(route, bytes).await?;
        debug!(task.id = %task.id(), %route, delivered, "task submitted");
        Ok(delivered)
    }

    /// Submits `task` with this node as `origin` and its reply queue as `reply-to`.
    ///
    /// Success outcomes come back through [`App::next_reply`]. A task without an id
    /// gets one here so the reply can be matched.
    pub async fn request(&self, task: Task, route: &Route) -> Result<TaskId> {
        let node_id = &self.dispatcher.policy().node_id;
        let replies = reply_queue(node_id);
        self.connector.declare(&replies).await?;

        let mut task = if task.id().is_empty() {
            Task::new(TaskId::generate(), task.task_type().clone(), task.payload().to_vec())
                .with_metadata(task.metadata().clone())
        } else {
            task
        };
        let metadata = task.metadata_mut();
        metadata.insert(keys::ORIGIN, node_id.as_str());
        metadata.insert(keys::REPLY_TO, replies);

        self.submit_to(&task, route).await?;
        Ok(task.id().clone())
    }

    /// Next outcome on this node's reply queue, waiting up to `wait`.
    pub async fn next_reply(&self, wait: Duration) -> Result<Option<OutcomeReport>> {
        let replies = reply_queue(&self.dispatcher.policy().node_id);
        Ok(self.connector.next_reply(&replies, wait).await?)
    }

    pub fn node_id(&self) -> &str {
        &self.dispatcher.policy().node_id
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &DispatchPolicy {
        self.dispatcher.policy()
    }

    pub fn counts(&self) -> DispatchCounts {
        self.dispatcher.counts()
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.pool().in_flight()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.dispatcher.pool().peak_in_flight()
    }
}
