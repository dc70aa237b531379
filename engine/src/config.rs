//! Engine configuration, typically stored as `plan-engine.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::io::paths::Sandbox;

/// How forgiving the engine is by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    Strict,
    Permissive,
}

/// What to do when a task's declared inputs are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessPolicy {
    /// Escalate immediately; the task is never dispatched.
    Enforce,
    /// Log a warning and dispatch anyway. Any subset of inputs may be missing.
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityMode {
    /// Sign documents when a key is available, never verify.
    Off,
    /// Require valid signatures on plan and status before running.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_usd: Option<f64>,
    pub max_tokens: Option<u64>,
    pub max_cpu_seconds: Option<f64>,
    /// Price applied to the wall-clock cost proxy of each task.
    pub usd_per_cpu_second: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_usd: None,
            max_tokens: None,
            max_cpu_seconds: None,
            usd_per_cpu_second: 0.0,
        }
    }
}

/// Immutable engine configuration.
///
/// Every path except `workspace_root` is relative to `workspace_root` and is
/// resolved through the sandbox. Missing fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    /// Directory holding `<initiative>/plans/<plan_id>/plan.json`.
    pub initiatives_dir: PathBuf,
    pub state_file: PathBuf,
    pub registry_file: PathBuf,
    pub queue_file: PathBuf,
    pub issues_dir: PathBuf,
    pub mode: RuntimeMode,
    /// Overrides the readiness behaviour implied by `mode`.
    pub readiness: Option<ReadinessPolicy>,
    pub integrity: IntegrityMode,
    /// Vault secret holding the HMAC key for document signatures.
    pub signing_secret: String,
    /// Any of these files existing halts the run before the next task.
    pub kill_switch_files: Vec<PathBuf>,
    /// Environment variable that halts the run when set to a non-empty value.
    pub kill_switch_env: Option<String>,
    pub budget: BudgetConfig,
    pub registry_history_limit: usize,
    pub allow_non_atomic_fallback: bool,
    /// JSON vault file; secrets come from the environment when unset.
    pub vault_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            initiatives_dir: PathBuf::from("initiatives"),
            state_file: PathBuf::from(".engine/state.json"),
            registry_file: PathBuf::from(".engine/registry.json"),
            queue_file: PathBuf::from(".engine/human_attention_queue.json"),
            issues_dir: PathBuf::from(".engine/issues"),
            mode: RuntimeMode::Strict,
            readiness: None,
            integrity: IntegrityMode::Off,
            signing_secret: "ENGINE_SIGNING_KEY".to_string(),
            kill_switch_files: vec![PathBuf::from(".engine/KILL")],
            kill_switch_env: Some("PLAN_ENGINE_KILL".to_string()),
            budget: BudgetConfig::default(),
            registry_history_limit: 50,
            allow_non_atomic_fallback: false,
            vault_file: None,
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `workspace_root`.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid =
            |msg: &str| -> Result<()> { Err(ConfigError::Invalid(msg.to_string()).into()) };
        if self.signing_secret.trim().is_empty() {
            return invalid("signing_secret must not be empty");
        }
        if self.registry_history_limit == 0 {
            return invalid("registry_history_limit must be > 0");
        }
        if self.budget.usd_per_cpu_second < 0.0 {
            return invalid("budget.usd_per_cpu_second must be >= 0");
        }
        for (name, limit) in [
            ("budget.max_usd", self.budget.max_usd),
            ("budget.max_cpu_seconds", self.budget.max_cpu_seconds),
        ] {
            if limit.is_some_and(|value| value < 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be >= 0")).into());
            }
        }
        for path in self.relative_paths() {
            self.sandbox().join_path(path)?;
        }
        Ok(())
    }

    fn relative_paths(&self) -> impl Iterator<Item = &PathBuf> {
        [
            &self.initiatives_dir,
            &self.state_file,
            &self.registry_file,
            &self.queue_file,
            &self.issues_dir,
        ]
        .into_iter()
        .chain(self.kill_switch_files.iter())
        .chain(self.vault_file.iter())
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        self.readiness.unwrap_or(match self.mode {
            RuntimeMode::Strict => ReadinessPolicy::Enforce,
            RuntimeMode::Permissive => ReadinessPolicy::Warn,
        })
    }

    pub fn sandbox(&self) -> Sandbox {
        Sandbox::new(&self.workspace_root)
    }

    /// Resolve a configured path through the sandbox.
    pub fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        Ok(self.sandbox().join_path(relative)?)
    }

    pub fn registry_path(&self) -> Result<PathBuf> {
        self.resolve(&self.registry_file)
    }

    pub fn queue_path(&self) -> Result<PathBuf> {
        self.resolve(&self.queue_file)
    }

    pub fn issues_path(&self) -> Result<PathBuf> {
        self.resolve(&self.issues_dir)
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        self.resolve(&self.state_file)
    }

    pub fn initiatives_path(&self) -> Result<PathBuf> {
        self.resolve(&self.initiatives_dir)
    }
}

/// Load config from a TOML file; a missing file yields defaults.
///
/// A relative `workspace_root` is interpreted relative to the config file.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let mut cfg: EngineConfig = toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    if cfg.workspace_root.is_relative() {
        if let Some(parent) = path.parent() {
            cfg.workspace_root = parent.join(&cfg.workspace_root);
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn partial_toml_fills_defaults_and_anchors_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan-engine.toml");
        fs::write(
            &path,
            "mode = \"permissive\"\n\n[budget]\nmax_usd = 2.5\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.mode, RuntimeMode::Permissive);
        assert_eq!(cfg.budget.max_usd, Some(2.5));
        assert_eq!(cfg.workspace_root, temp.path().join("."));
        assert_eq!(cfg.readiness_policy(), ReadinessPolicy::Warn);
    }

    #[test]
    fn explicit_readiness_overrides_mode() {
        let cfg = EngineConfig {
            mode: RuntimeMode::Permissive,
            readiness: Some(ReadinessPolicy::Enforce),
            ..EngineConfig::default()
        };
        assert_eq!(cfg.readiness_policy(), ReadinessPolicy::Enforce);
        assert_eq!(
            EngineConfig::default().readiness_policy(),
            ReadinessPolicy::Enforce
        );
    }

    #[test]
    fn rejects_paths_escaping_workspace() {
        let cfg = EngineConfig {
            registry_file: PathBuf::from("../shared/registry.json"),
            ..EngineConfig::for_workspace("/ws")
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.is_security());
    }

    #[test]
    fn rejects_zero_history_limit() {
        let cfg = EngineConfig {
            registry_history_limit: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_mode_is_a_parse_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan-engine.toml");
        fs::write(&path, "mode = \"yolo\"\n").expect("write");
        assert!(matches!(
            load_config(&path),
            Err(crate::error::EngineError::Config(ConfigError::Parse { .. }))
        ));
    }
}
