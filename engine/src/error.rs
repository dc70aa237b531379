//! Typed error kinds shared by every engine component.
//!
//! Library code returns [`EngineError`]; the CLI driver wraps it in `anyhow`
//! for reporting. The split matters at one boundary: the task executor turns
//! every handler error into a failed outcome *except* [`SecurityError`], which
//! must reach the top level untouched.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DataSafety(#[from] DataSafetyError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("execution error: {0}")]
    Execution(String),
}

impl EngineError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn is_security(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}

/// Configuration and document loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("plan '{plan_id}' found in multiple initiatives: {paths:?}")]
    Ambiguous { plan_id: String, paths: Vec<PathBuf> },
    #[error("parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("schema validation failed for {path}: {}", messages.join("; "))]
    Schema { path: PathBuf, messages: Vec<String> },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures that threaten on-disk consistency.
#[derive(Debug, Error)]
pub enum DataSafetyError {
    #[error("atomic write to {path} failed: {source}")]
    AtomicWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("lock on {path} is held by another writer")]
    WriteConflict { path: PathBuf },
    #[error("state version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DataSafetyError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Categorically fatal violations; never converted into a task failure.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("path '{path}' escapes sandbox root {root}")]
    PathEscape { root: PathBuf, path: String },
    #[error("signature check failed for {path}: {reason}")]
    Signature { path: PathBuf, reason: String },
    #[error("integrity mode is strict but secret '{0}' is not available")]
    MissingSigningKey(String),
    #[error("vault error: {0}")]
    Vault(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("dependency cycle among tasks: {}", tasks.join(", "))]
    Cycle { tasks: Vec<String> },
    #[error("task '{task_id}' depends on undefined task '{dependency}'")]
    UndefinedDependency { task_id: String, dependency: String },
    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),
}
