//! Secret access contract plus file and environment backed vaults.
//!
//! Handlers never see the full vault: [`scoped_secrets`] keeps only secrets
//! scoped `global` or scoped to the task's type.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::types::Task;
use crate::error::SecurityError;

pub const GLOBAL_SCOPE: &str = "global";
const ENV_PREFIX: &str = "PLAN_ENGINE_SECRET_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub value: String,
    #[serde(default = "global_scope")]
    pub scope: String,
}

fn global_scope() -> String {
    GLOBAL_SCOPE.to_string()
}

/// Secret name -> value, already filtered for one task.
pub type SecretMap = BTreeMap<String, String>;

pub trait Vault {
    fn list_secrets(&self) -> Result<BTreeMap<String, Secret>, SecurityError>;

    fn secret_value(&self, name: &str) -> Result<Option<String>, SecurityError> {
        Ok(self.list_secrets()?.remove(name).map(|secret| secret.value))
    }
}

impl<V: Vault + ?Sized> Vault for Box<V> {
    fn list_secrets(&self) -> Result<BTreeMap<String, Secret>, SecurityError> {
        (**self).list_secrets()
    }
}

/// Keep only the secrets `task` may see.
pub fn scoped_secrets(all: &BTreeMap<String, Secret>, task: &Task) -> SecretMap {
    all.iter()
        .filter(|(_, secret)| secret.scope == GLOBAL_SCOPE || secret.scope == task.task_type)
        .map(|(name, secret)| (name.clone(), secret.value.clone()))
        .collect()
}

/// Vault read from a JSON document `{name: {value, scope}}`.
#[derive(Debug, Clone)]
pub struct JsonVault {
    path: PathBuf,
}

impl JsonVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Vault for JsonVault {
    fn list_secrets(&self) -> Result<BTreeMap<String, Secret>, SecurityError> {
        let contents = fs::read_to_string(&self.path)
            .map_err(|err| SecurityError::Vault(format!("read {}: {err}", self.path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|err| SecurityError::Vault(format!("parse {}: {err}", self.path.display())))
    }
}

/// Vault over `PLAN_ENGINE_SECRET_<NAME>` environment variables, all global.
#[derive(Debug, Clone, Default)]
pub struct EnvVault;

impl Vault for EnvVault {
    fn list_secrets(&self) -> Result<BTreeMap<String, Secret>, SecurityError> {
        Ok(std::env::vars()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(ENV_PREFIX)?;
                Some((
                    name.to_string(),
                    Secret {
                        value,
                        scope: global_scope(),
                    },
                ))
            })
            .collect())
    }
}

/// In-memory vault for embedding callers and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryVault {
    secrets: BTreeMap<String, Secret>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: &str, value: &str, scope: &str) -> Self {
        self.secrets.insert(
            name.to_string(),
            Secret {
                value: value.to_string(),
                scope: scope.to_string(),
            },
        );
        self
    }
}

impl Vault for MemoryVault {
    fn list_secrets(&self) -> Result<BTreeMap<String, Secret>, SecurityError> {
        Ok(self.secrets.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(task_type: &str) -> Task {
        Task {
            task_id: "t".to_string(),
            task_type: task_type.to_string(),
            dependencies: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: json!({}),
        }
    }

    #[test]
    fn scope_filter_keeps_global_and_matching_type() {
        let vault = MemoryVault::new()
            .with_secret("shared", "s", GLOBAL_SCOPE)
            .with_secret("snap", "x", "CREATE_SNAPSHOT")
            .with_secret("other", "y", "ROTATE_REGISTRY");
        let all = vault.list_secrets().expect("list");

        let visible = scoped_secrets(&all, &task("CREATE_SNAPSHOT"));
        assert_eq!(visible.keys().collect::<Vec<_>>(), vec!["shared", "snap"]);
    }

    #[test]
    fn json_vault_defaults_scope_to_global() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("vault.json");
        fs::write(&path, r#"{"ENGINE_SIGNING_KEY": {"value": "k"}}"#).expect("write");

        let vault = JsonVault::new(&path);
        assert_eq!(
            vault.secret_value("ENGINE_SIGNING_KEY").expect("lookup"),
            Some("k".to_string())
        );
        assert_eq!(
            vault.list_secrets().expect("list")["ENGINE_SIGNING_KEY"].scope,
            GLOBAL_SCOPE
        );
    }

    #[test]
    fn unreadable_vault_is_a_security_error() {
        let vault = JsonVault::new("/nonexistent/vault.json");
        assert!(matches!(vault.list_secrets(), Err(SecurityError::Vault(_))));
    }
}
