use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{CronError, Result};
use crate::types::JobOutcome;

/// A callable registered under a `"Target::entry_point"` dispatch name.
pub trait JobHandler: Send + Sync {
    fn call(&self, params: &[Value]) -> anyhow::Result<JobOutcome>;
}

/// Adapter so plain closures can be registered without naming a type.
struct FnHandler<F>(F);

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&[Value]) -> anyhow::Result<JobOutcome> + Send + Sync,
{
    fn call(&self, params: &[Value]) -> anyhow::Result<JobOutcome> {
        (self.0)(params)
    }
}

/// Dispatch table mapping handler names to callables.
///
/// Jobs are queued by symbolic name and resolved here at claim time, so the
/// queue survives restarts and handler code can move freely between builds.
/// Populate at startup, before the first cron pass.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its full dispatch name. Last registration
    /// for a name wins.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) -> anyhow::Result<JobOutcome> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(handler = %name, "job handler registered");
        self.handlers.insert(name, Arc::new(FnHandler(handler)));
    }

    /// Resolve a dispatch name. A name without the `Target::entry_point`
    /// shape, or with no registration, is not executable.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn JobHandler>> {
        match name.split_once("::") {
            Some((target, entry)) if !target.is_empty() && !entry.is_empty() => self
                .handlers
                .get(name)
                .cloned()
                .ok_or_else(|| CronError::NotExecutable {
                    handler: name.to_string(),
                }),
            _ => Err(CronError::NotExecutable {
                handler: name.to_string(),
            }),
        }
    }
}

/// A module's declaration of one interval-gated recurring task.
#[derive(Debug, Clone)]
pub struct RecurringTask {
    /// Task code, unique within the module. The interval record code is
    /// `"<module_id>_<code>"`.
    pub code: String,
    /// Minimum minutes between runs.
    pub interval_minutes: i64,
    /// Module method invoked when the task is due.
    pub method: String,
}

/// Implemented by platform modules that want scheduled work.
pub trait CronModule: Send + Sync {
    /// Stable module identifier, prefixed onto task codes.
    fn id(&self) -> &str;

    /// Recurring-task declarations. Default: none.
    fn recurring_tasks(&self) -> Vec<RecurringTask> {
        Vec::new()
    }

    /// Invoke a declared task method by name.
    ///
    /// `Ok(true)` marks the task complete; `Ok(false)` means "did not run":
    /// the interval is reverted so the task stays due. Errors are reported
    /// on the event channel and leave the interval at the pre-invocation
    /// write.
    fn run_task(&self, method: &str) -> anyhow::Result<bool>;
}

/// The set of registered modules visible to the recurring-task runner.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn CronModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: impl CronModule + 'static) {
        debug!(module = module.id(), "cron module registered");
        self.modules.push(Arc::new(module));
    }

    pub fn modules(&self) -> &[Arc<dyn CronModule>] {
        &self.modules
    }
}
