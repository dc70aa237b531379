//! Task type to handler dispatch.
//!
//! This is the boundary where handler failures become a plain `false`
//! outcome. Security violations are the one exception and always propagate.

use std::collections::BTreeMap;

use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::core::types::Task;
use crate::error::{EngineError, Result, SecurityError};
use crate::handlers;
use crate::io::state::EngineState;
use crate::io::vault::SecretMap;

/// Handler for one task type. Returns `true` only if the task's promised
/// output now exists consistently.
pub type Handler =
    Box<dyn Fn(&Task, &EngineConfig, &EngineState, &SecretMap) -> Result<bool> + Send + Sync>;

#[derive(Default)]
pub struct TaskExecutor {
    handlers: BTreeMap<String, Handler>,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("types", &self.handler_types().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskExecutor {
    /// Executor with no handlers; every dispatch reports an unknown type.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtin_handlers() -> Self {
        let mut executor = Self::empty();
        executor.register(handlers::CREATE_DIRECTORY, handlers::create_directory);
        executor.register(
            handlers::CREATE_FILE_FROM_TEMPLATE,
            handlers::create_file_from_template,
        );
        executor.register(handlers::CREATE_SNAPSHOT, handlers::create_snapshot);
        executor.register(
            handlers::GENERATE_COST_REPORT,
            handlers::generate_cost_report,
        );
        executor.register(handlers::ROTATE_REGISTRY, handlers::rotate_registry);
        executor
    }

    /// Register `handler` for `task_type`, replacing any previous one.
    pub fn register<F>(&mut self, task_type: &str, handler: F)
    where
        F: Fn(&Task, &EngineConfig, &EngineState, &SecretMap) -> Result<bool>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(task_type.to_string(), Box::new(handler));
    }

    pub fn handler_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run the handler for `task.task_type`.
    #[instrument(skip_all, fields(task_id = %task.task_id, task_type = %task.task_type))]
    pub fn dispatch(
        &self,
        task: &Task,
        config: &EngineConfig,
        state: &EngineState,
        secrets: &SecretMap,
    ) -> Result<bool, SecurityError> {
        let Some(handler) = self.handlers.get(&task.task_type) else {
            warn!("no handler registered for task type");
            return Ok(false);
        };
        match handler(task, config, state, secrets) {
            Ok(done) => {
                debug!(done, "handler finished");
                Ok(done)
            }
            Err(EngineError::Security(err)) => Err(err),
            Err(err) => {
                warn!(error = %err, "handler failed");
                Ok(false)
            }
        }
    }
}
