//! WorkerPool - 同時実行数の制御と実行の隔離
//!
//! # 学習ポイント
//! - `Semaphore::acquire_owned` による slot（permit を Drop で返す）
//! - 全体の上限とモジュールごとの上限（実効値は min）
//! - JoinHandle 経由で panic を 1 タスクに閉じ込める
//!
//! # Slot の流れ
//! 1. `reserve()`: 全体の slot を確保（dispatcher はこれが取れるまで次を読まない）
//! 2. `admit()`: モジュールの slot を確保し、in-flight として数える
//! 3. `spawn()`: slot を持ったまま実行。完了（または panic）で slot が返る
//!
//! timeout しても実行中のタスクは強制終了しない。slot は handler が戻るまで保持される。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};

use crate::domain::TaskType;
use crate::module::ModuleRegistry;

#[derive(Debug, Default)]
struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    idle: Notify,
}

/// A global slot, held while waiting for the module slot.
#[derive(Debug)]
pub struct Reservation {
    permit: OwnedSemaphorePermit,
}

/// Both permits of a running execution.
#[derive(Debug)]
pub struct Slot {
    _global: OwnedSemaphorePermit,
    _module: Option<OwnedSemaphorePermit>,
    gauge: Arc<Gauge>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.gauge.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gauge.idle.notify_waiters();
        }
    }
}

/// The execution panicked (or was aborted).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("execution panicked: {0}")]
pub struct ExecutionPanic(pub String);

impl ExecutionPanic {
    fn from_join_error(error: JoinError) -> Self {
        if !error.is_panic() {
            return Self("execution was cancelled".to_string());
        }
        let payload = error.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self(message)
    }
}

/// Handle to a spawned execution.
pub struct Execution<T> {
    handle: JoinHandle<T>,
}

impl<T> Execution<T> {
    pub async fn join(self) -> Result<T, ExecutionPanic> {
        self.handle.await.map_err(ExecutionPanic::from_join_error)
    }
}

struct ModuleGate {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

pub struct WorkerPool {
    global: Arc<Semaphore>,
    limit: usize,
    modules: HashMap<TaskType, ModuleGate>,
    gauge: Arc<Gauge>,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            global: Arc::new(Semaphore::new(limit)),
            limit,
            modules: HashMap::new(),
            gauge: Arc::new(Gauge::default()),
        }
    }

    /// Pool sized by `limit` with every module's own cap from the registry.
    pub fn for_registry(limit: usize, registry: &ModuleRegistry) -> Self {
        registry.modules().fold(Self::new(limit), |pool, module| {
            match module.concurrency_limit() {
                Some(cap) => pool.with_module_limit(module.identifier().clone(), cap),
                None => pool,
            }
        })
    }

    pub fn with_module_limit(mut self, module: impl Into<TaskType>, limit: usize) -> Self {
        let effective = limit.clamp(1, self.limit);
        let gate = ModuleGate {
            limit: effective,
            semaphore: Arc::new(Semaphore::new(effective)),
        };
        self.modules.insert(module.into(), gate);
        self
    }

    /// Waits for a global slot. `None` once the pool is closed.
    pub async fn reserve(&self) -> Option<Reservation> {
        let permit = Arc::clone(&self.global).acquire_owned().await.ok()?;
        Some(Reservation { permit })
    }

    /// Waits for the module slot and marks the execution in flight.
    pub async fn admit(&self, reservation: Reservation, module: &TaskType) -> Option<Slot> {
        let module_permit = match self.modules.get(module) {
            Some(gate) => Some(Arc::clone(&gate.semaphore).acquire_owned().await.ok()?),
            None => None,
        };
        let now = self.gauge.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.gauge.peak.fetch_max(now, Ordering::AcqRel);
        Some(Slot {
            _global: reservation.permit,
            _module: module_permit,
            gauge: Arc::clone(&self.gauge),
        })
    }

    /// Runs `future` on the runtime, holding `slot` until it finishes.
    pub fn spawn<F>(&self, slot: Slot, future: F) -> Execution<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Execution {
            handle: tokio::spawn(async move {
                let _slot = slot;
                future.await
            }),
        }
    }

    /// Runs `f` on the blocking thread pool, holding `slot` until it returns.
    pub fn spawn_blocking<F, T>(&self, slot: Slot, f: F) -> Execution<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Execution {
            handle: tokio::task::spawn_blocking(move || {
                let _slot = slot;
                f()
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Effective cap for `module`.
    pub fn module_limit(&self, module: &TaskType) -> usize {
        self.modules.get(module).map_or(self.limit, |gate| gate.limit)
    }

    pub fn in_flight(&self) -> usize {
        self.gauge.in_flight.load(Ordering::Acquire)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.gauge.peak.load(Ordering::Acquire)
    }

    /// Global slots not reserved right now.
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    /// Wakes pending `reserve`/`admit` calls with `None`. Running executions are unaffected.
    pub fn close(&self) {
        self.global.close();
        for gate in self.modules.values() {
            gate.semaphore.close();
        }
    }

    /// Resolves once nothing is in flight.
    pub async fn idle(&self) {
        loop {
            let notified = self.gauge.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}
