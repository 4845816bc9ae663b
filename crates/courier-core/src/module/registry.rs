//! ModuleRegistry - モジュールの登録と解決
//!
//! # 学習ポイント
//! - 二段階のライフサイクル: `RegistryBuilder`（可変）→ `ModuleRegistry`（不変）
//! - 不変になった後は `Arc` で共有し、ロック無しで読む
//! - `OnceLock` によるプロセス全体で一度だけの install
//! - 依存関係の解決: `freeze()` 時に依存先を先に並べる（start は依存先から、stop はその逆順）

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::{Capabilities, Module};
use crate::domain::TaskType;

static GLOBAL: OnceLock<ModuleRegistry> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("module `{0}` is already registered")]
    DuplicateModule(String),

    #[error("no module registered as `{0}`")]
    UnknownModule(String),

    #[error("invalid module `{identifier}`: {reason}")]
    InvalidModule { identifier: String, reason: String },

    #[error("modules expected but not registered: {0:?}")]
    MissingModules(Vec<String>),

    #[error("a process-wide module registry is already installed")]
    AlreadyInstalled,

    #[error("module `{module}` depends on `{dependency}`, which is not registered")]
    UnknownDependency { module: String, dependency: String },

    #[error("module dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
}

type Factory = Box<dyn Fn() -> Arc<dyn Module> + Send + Sync>;

/// One row of the startup discovery table.
pub struct ModuleEntry {
    identifier: TaskType,
    factory: Factory,
    concurrency_limit: Option<usize>,
    timeout: Option<Duration>,
    dependencies: Vec<TaskType>,
}

impl ModuleEntry {
    pub fn new<F>(identifier: impl Into<TaskType>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Module> + Send + Sync + 'static,
    {
        Self {
            identifier: identifier.into(),
            factory: Box::new(factory),
            concurrency_limit: None,
            timeout: None,
            dependencies: Vec::new(),
        }
    }

    /// Caps concurrent executions of this module (still bounded by the global limit).
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Overrides the global task timeout for this module.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Modules that must be started before this one (and stopped after it).
    pub fn depends_on<I, T>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskType>,
    {
        for dependency in dependencies {
            let dependency = dependency.into();
            if !self.dependencies.contains(&dependency) {
                self.dependencies.push(dependency);
            }
        }
        self
    }

    pub fn identifier(&self) -> &TaskType {
        &self.identifier
    }

    pub fn dependencies(&self) -> &[TaskType] {
        &self.dependencies
    }
}

impl fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("identifier", &self.identifier)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("timeout", &self.timeout)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// A module instance plus the settings captured at registration.
pub struct RegisteredModule {
    identifier: TaskType,
    module: Arc<dyn Module>,
    capabilities: Capabilities,
    concurrency_limit: Option<usize>,
    timeout: Option<Duration>,
    dependencies: Vec<TaskType>,
}

impl RegisteredModule {
    pub fn identifier(&self) -> &TaskType {
        &self.identifier
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn concurrency_limit(&self) -> Option<usize> {
        self.concurrency_limit
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn dependencies(&self) -> &[TaskType] {
        &self.dependencies
    }
}

impl fmt::Debug for RegisteredModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredModule")
            .field("identifier", &self.identifier)
            .field("capabilities", &self.capabilities)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("timeout", &self.timeout)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Mutable registration phase.
#[derive(Default)]
pub struct RegistryBuilder {
    modules: HashMap<TaskType, RegisteredModule>,
    order: Vec<TaskType>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `entry`, instantiates the module and records its capabilities.
    pub fn register(&mut self, entry: ModuleEntry) -> Result<(), RegistryError> {
        validate(&entry)?;
        if self.modules.contains_key(&entry.identifier) {
            return Err(RegistryError::DuplicateModule(entry.identifier.to_string()));
        }

        let module = (entry.factory)();
        let registered = RegisteredModule {
            identifier: entry.identifier.clone(),
            capabilities: module.capabilities(),
            module,
            concurrency_limit: entry.concurrency_limit,
            timeout: entry.timeout,
            dependencies: entry.dependencies,
        };
        tracing::debug!(module = %registered.identifier, capabilities = ?registered.capabilities, "module registered");
        self.order.push(entry.identifier.clone());
        self.modules.insert(entry.identifier, registered);
        Ok(())
    }

    /// Registers every entry, stopping at the first error.
    pub fn register_all(&mut self, entries: impl IntoIterator<Item = ModuleEntry>) -> Result<(), RegistryError> {
        entries.into_iter().try_for_each(|entry| self.register(entry))
    }

    /// Applies configuration overrides. Overrides for unregistered modules are an error.
    pub fn override_limits(
        &mut self,
        identifier: &str,
        concurrency_limit: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<(), RegistryError> {
        let module = self
            .modules
            .get_mut(identifier)
            .ok_or_else(|| RegistryError::UnknownModule(identifier.to_string()))?;
        if concurrency_limit == Some(0) {
            return Err(invalid(identifier, "concurrency limit must be greater than zero"));
        }
        if timeout == Some(Duration::ZERO) {
            return Err(invalid(identifier, "timeout must be greater than zero"));
        }
        if concurrency_limit.is_some() {
            module.concurrency_limit = concurrency_limit;
        }
        if timeout.is_some() {
            module.timeout = timeout;
        }
        Ok(())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.modules.contains_key(identifier)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &TaskType> {
        self.order.iter()
    }

    /// Ends the registration phase.
    ///
    /// Modules are ordered so that every module comes after its dependencies;
    /// otherwise registration order is kept. Unknown dependencies and cycles fail here.
    pub fn freeze(self) -> Result<ModuleRegistry, RegistryError> {
        let order = start_order(&self.order, &self.modules)?;
        let mut modules = self.modules;
        let ordered = order
            .into_iter()
            .filter_map(|id| modules.remove(&id).map(Arc::new))
            .collect::<Vec<_>>();
        let index = ordered
            .iter()
            .map(|m| (m.identifier.clone(), Arc::clone(m)))
            .collect();
        Ok(ModuleRegistry {
            modules: Arc::new(index),
            ordered: ordered.into(),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Depth-first: a module's dependencies are placed before it.
fn start_order(
    registration: &[TaskType],
    modules: &HashMap<TaskType, RegisteredModule>,
) -> Result<Vec<TaskType>, RegistryError> {
    fn visit(
        id: &TaskType,
        modules: &HashMap<TaskType, RegisteredModule>,
        marks: &mut HashMap<TaskType, Visit>,
        path: &mut Vec<TaskType>,
        order: &mut Vec<TaskType>,
    ) -> Result<(), RegistryError> {
        match marks.get(id) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                let start = path.iter().position(|p| p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(TaskType::to_string).collect();
                cycle.push(id.to_string());
                return Err(RegistryError::DependencyCycle(cycle));
            }
            None => {}
        }

        let Some(module) = modules.get(id) else {
            return Ok(());
        };
        marks.insert(id.clone(), Visit::InProgress);
        path.push(id.clone());
        for dependency in &module.dependencies {
            if !modules.contains_key(dependency) {
                return Err(RegistryError::UnknownDependency {
                    module: id.to_string(),
                    dependency: dependency.to_string(),
                });
            }
            visit(dependency, modules, marks, path, order)?;
        }
        path.pop();
        marks.insert(id.clone(), Visit::Done);
        order.push(id.clone());
        Ok(())
    }

    let mut marks = HashMap::with_capacity(registration.len());
    let mut order = Vec::with_capacity(registration.len());
    for id in registration {
        visit(id, modules, &mut marks, &mut Vec::new(), &mut order)?;
    }
    Ok(order)
}

fn invalid(identifier: &str, reason: &str) -> RegistryError {
    RegistryError::InvalidModule {
        identifier: identifier.to_string(),
        reason: reason.to_string(),
    }
}

fn validate(entry: &ModuleEntry) -> Result<(), RegistryError> {
    let id = entry.identifier.as_str();
    if id.is_empty() {
        return Err(invalid(id, "identifier must not be empty"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(invalid(id, "identifier must not contain whitespace"));
    }
    if entry.concurrency_limit == Some(0) {
        return Err(invalid(id, "concurrency limit must be greater than zero"));
    }
    if entry.timeout == Some(Duration::ZERO) {
        return Err(invalid(id, "timeout must be greater than zero"));
    }
    Ok(())
}

/// Frozen, read-only registry. Cloning shares the same modules.
#[derive(Clone)]
pub struct ModuleRegistry {
    modules: Arc<HashMap<TaskType, Arc<RegisteredModule>>>,
    ordered: Arc<[Arc<RegisteredModule>]>,
}

impl ModuleRegistry {
    /// Builds a frozen registry straight from a discovery table.
    pub fn from_entries(entries: impl IntoIterator<Item = ModuleEntry>) -> Result<Self, RegistryError> {
        let mut builder = RegistryBuilder::new();
        builder.register_all(entries)?;
        builder.freeze()
    }

    pub fn resolve(&self, identifier: &str) -> Result<Arc<RegisteredModule>, RegistryError> {
        self.modules
            .get(identifier)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownModule(identifier.to_string()))
    }

    /// Modules in start order: dependencies first, otherwise registration order.
    pub fn modules(&self) -> impl Iterator<Item = &Arc<RegisteredModule>> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Installs this registry as the process-wide instance. Works once.
    pub fn install(self) -> Result<&'static ModuleRegistry, RegistryError> {
        GLOBAL.set(self).map_err(|_| RegistryError::AlreadyInstalled)?;
        GLOBAL.get().ok_or(RegistryError::AlreadyInstalled)
    }

    pub fn global() -> Option<&'static ModuleRegistry> {
        GLOBAL.get()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ordered.iter().map(|m| m.identifier()))
            .finish()
    }
}
