//! Test-only fixtures: a throwaway workspace and a task builder.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::core::types::{
    GlobalRegistry, HumanAttentionQueueEntry, Issue, Plan, PlanStatus, Task,
};
use crate::io::atomic::{read_json_shared, write_json_atomic};
use crate::io::plan_store::{PLAN_FILE, STATUS_FILE};
use crate::io::registry::load_registry;
use crate::io::signing::sign_existing;
use crate::io::state::FileStateManager;

/// Builder for a task with deterministic defaults.
#[derive(Debug, Clone)]
pub struct TaskBuilder(Task);

pub fn task(task_id: &str, task_type: &str) -> TaskBuilder {
    TaskBuilder(Task {
        task_id: task_id.to_string(),
        task_type: task_type.to_string(),
        dependencies: Vec::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        params: json!({}),
    })
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

impl TaskBuilder {
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.0.dependencies = owned(deps);
        self
    }

    pub fn inputs(mut self, inputs: &[&str]) -> Self {
        self.0.inputs = owned(inputs);
        self
    }

    pub fn outputs(mut self, outputs: &[&str]) -> Self {
        self.0.outputs = owned(outputs);
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.0.params = params;
        self
    }

    pub fn build(self) -> Task {
        self.0
    }
}

/// Temp workspace with a config rooted at it. Removed on drop.
#[derive(Debug)]
pub struct Workspace {
    temp: TempDir,
    pub config: EngineConfig,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            // Tests must not be halted by the caller's environment.
            kill_switch_env: None,
            ..EngineConfig::for_workspace(temp.path())
        };
        Self { temp, config }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn state_manager(&self) -> FileStateManager {
        FileStateManager::new(self.config.state_path().expect("state path"))
    }

    fn plan_dir(&self, initiative: &str, plan_id: &str) -> PathBuf {
        self.root()
            .join(&self.config.initiatives_dir)
            .join(initiative)
            .join("plans")
            .join(plan_id)
    }

    pub fn plan_path(&self, initiative: &str, plan_id: &str) -> PathBuf {
        self.plan_dir(initiative, plan_id).join(PLAN_FILE)
    }

    pub fn status_path(&self, initiative: &str, plan_id: &str) -> PathBuf {
        self.plan_dir(initiative, plan_id).join(STATUS_FILE)
    }

    pub fn write_plan(&self, initiative: &str, plan_id: &str, tasks: &[TaskBuilder]) -> PathBuf {
        let plan = Plan {
            plan_id: plan_id.to_string(),
            tasks: tasks.iter().cloned().map(TaskBuilder::build).collect(),
        };
        let path = self.plan_path(initiative, plan_id);
        write_json_atomic(&path, &plan, None).expect("write plan");
        path
    }

    pub fn sign(&self, path: &Path, key: &str) {
        sign_existing(path, key.as_bytes()).expect("sign");
    }

    pub fn write_file(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn read_status(&self, initiative: &str, plan_id: &str) -> PlanStatus {
        read_json_shared(&self.status_path(initiative, plan_id)).expect("read status")
    }

    pub fn queue(&self) -> Vec<HumanAttentionQueueEntry> {
        let path = self.config.queue_path().expect("queue path");
        if !path.exists() {
            return Vec::new();
        }
        read_json_shared(&path).expect("read queue")
    }

    pub fn issues(&self) -> Vec<Issue> {
        let dir = self.config.issues_path().expect("issues path");
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        paths
            .iter()
            .map(|path| read_json_shared(path).expect("read issue"))
            .collect()
    }

    pub fn registry(&self) -> GlobalRegistry {
        load_registry(&self.config.registry_path().expect("registry path")).expect("registry")
    }
}
