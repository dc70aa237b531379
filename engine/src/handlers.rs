//! Built-in task handlers.
//!
//! Every handler resolves paths through the workspace sandbox, performs one
//! unit of work and reports `true` only once its output can be observed on
//! disk. Tracked artifacts are recorded in the global registry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use minijinja::{Environment, UndefinedBehavior, context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::EngineConfig;
use crate::core::types::{CostRecord, Task, TaskOutcome};
use crate::error::{DataSafetyError, EngineError, Result};
use crate::io::atomic::{WriteOptions, atomic_write_with, to_json_bytes};
use crate::io::plan_store::{load_status, locate_plan};
use crate::io::registry::{self, ArtifactRecord, register_artifacts};
use crate::io::state::EngineState;
use crate::io::vault::SecretMap;

pub const CREATE_DIRECTORY: &str = "CREATE_DIRECTORY";
pub const CREATE_FILE_FROM_TEMPLATE: &str = "CREATE_FILE_FROM_TEMPLATE";
pub const CREATE_SNAPSHOT: &str = "CREATE_SNAPSHOT";
pub const GENERATE_COST_REPORT: &str = "GENERATE_COST_REPORT";
pub const ROTATE_REGISTRY: &str = "ROTATE_REGISTRY";

pub const MANIFEST_FILE: &str = "manifest.json";

fn first_output(task: &Task) -> Result<&str> {
    task.outputs
        .first()
        .map(String::as_str)
        .ok_or_else(|| EngineError::execution(format!("task '{}' declares no outputs", task.task_id)))
}

/// Registry id for the task's artifact: `params.artifact_id` or the output path.
fn artifact_id<'t>(task: &'t Task, output: &'t str) -> &'t str {
    task.param_str("artifact_id").unwrap_or(output)
}

/// Generation the task's DONE entry will carry. The runner takes it right
/// after the handler succeeds, so registry entries written here use it too.
fn task_generation(state: &EngineState) -> u64 {
    state.g + 1
}

fn write_options(config: &EngineConfig) -> WriteOptions<'static> {
    WriteOptions {
        signing_key: None,
        allow_non_atomic_fallback: config.allow_non_atomic_fallback,
    }
}

#[instrument(skip_all, fields(task_id = %task.task_id))]
pub fn create_directory(
    task: &Task,
    config: &EngineConfig,
    _state: &EngineState,
    _secrets: &SecretMap,
) -> Result<bool> {
    if task.outputs.is_empty() {
        return Err(EngineError::execution("CREATE_DIRECTORY needs at least one output"));
    }
    let sandbox = config.sandbox();
    let mut created = Vec::with_capacity(task.outputs.len());
    for output in &task.outputs {
        let dir = sandbox.join(output)?;
        fs::create_dir_all(&dir).map_err(|err| DataSafetyError::io(&dir, err))?;
        debug!(dir = %dir.display(), "directory ensured");
        created.push(dir);
    }
    Ok(created.iter().all(|dir| dir.is_dir()))
}

#[instrument(skip_all, fields(task_id = %task.task_id))]
pub fn create_file_from_template(
    task: &Task,
    config: &EngineConfig,
    state: &EngineState,
    _secrets: &SecretMap,
) -> Result<bool> {
    let sandbox = config.sandbox();
    let output = first_output(task)?;
    let source = match task.param_str("template_text") {
        Some(text) => text.to_string(),
        None => {
            let template = task
                .param_str("template")
                .or_else(|| task.inputs.first().map(String::as_str))
                .ok_or_else(|| {
                    EngineError::execution("no template_text, template param or input given")
                })?;
            let path = sandbox.join(template)?;
            fs::read_to_string(&path).map_err(|err| DataSafetyError::io(&path, err))?
        }
    };

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    let vars = task
        .params
        .get("vars")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    let rendered = env
        .render_str(
            &source,
            context! {
                plan_id => state.cp_id.as_deref().unwrap_or_default(),
                task_id => task.task_id.as_str(),
                g => state.g,
                vars => vars,
            },
        )
        .map_err(|err| EngineError::execution(format!("render template: {err}")))?;

    let path = sandbox.join(output)?;
    atomic_write_with(&path, rendered.as_bytes(), write_options(config))?;
    register_artifacts(
        &config.registry_path()?,
        &[ArtifactRecord {
            artifact_id: artifact_id(task, output).to_string(),
            filepath: output.to_string(),
            action: "rendered".to_string(),
        }],
        task_generation(state),
    )?;
    info!(output, bytes = rendered.len(), "template rendered");
    Ok(path.is_file())
}

/// Contents of a snapshot's `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub task_id: String,
    pub g: u64,
    /// Workspace-relative source path -> SHA-256 (hex) of the copied bytes.
    pub files: BTreeMap<String, String>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn copy_hashed(src: &Path, dest: &Path) -> Result<String> {
    let bytes = fs::read(src).map_err(|err| DataSafetyError::io(src, err))?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| DataSafetyError::io(parent, err))?;
    }
    fs::write(dest, &bytes).map_err(|err| DataSafetyError::io(dest, err))?;
    Ok(sha256_hex(&bytes))
}

fn verify_manifest(dest: &Path, manifest: &SnapshotManifest) -> bool {
    manifest.files.iter().all(|(relative, expected)| {
        fs::read(dest.join(relative)).is_ok_and(|bytes| sha256_hex(&bytes) == *expected)
    })
}

#[instrument(skip_all, fields(task_id = %task.task_id))]
pub fn create_snapshot(
    task: &Task,
    config: &EngineConfig,
    state: &EngineState,
    _secrets: &SecretMap,
) -> Result<bool> {
    let sandbox = config.sandbox();
    let output = first_output(task)?;
    if task.inputs.is_empty() {
        return Err(EngineError::execution("CREATE_SNAPSHOT needs at least one input"));
    }
    let dest = sandbox.join(output)?;

    let mut manifest = SnapshotManifest {
        task_id: task.task_id.clone(),
        g: state.g,
        files: BTreeMap::new(),
    };
    for input in &task.inputs {
        let src = sandbox.join(input)?;
        if src.is_file() {
            let relative = sandbox.relative(&src);
            let digest = copy_hashed(&src, &dest.join(&relative))?;
            manifest.files.insert(relative, digest);
            continue;
        }
        if !src.is_dir() {
            return Err(EngineError::execution(format!("snapshot input '{input}' does not exist")));
        }
        for entry in WalkDir::new(&src)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !entry.path().starts_with(&dest))
        {
            let entry = entry.map_err(|err| EngineError::execution(format!("walk {input}: {err}")))?;
            if entry.file_type().is_symlink() {
                warn!(path = %entry.path().display(), "skipping symlink in snapshot");
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = sandbox.relative(entry.path());
            let digest = copy_hashed(entry.path(), &dest.join(&relative))?;
            manifest.files.insert(relative, digest);
        }
    }

    let manifest_path = dest.join(MANIFEST_FILE);
    atomic_write_with(&manifest_path, &to_json_bytes(&manifest)?, write_options(config))?;
    if !verify_manifest(&dest, &manifest) {
        warn!(dest = %dest.display(), "snapshot does not match its manifest");
        return Ok(false);
    }
    register_artifacts(
        &config.registry_path()?,
        &[ArtifactRecord {
            artifact_id: artifact_id(task, output).to_string(),
            filepath: sandbox.relative(&manifest_path),
            action: "snapshot".to_string(),
        }],
        task_generation(state),
    )?;
    info!(files = manifest.files.len(), dest = %dest.display(), "snapshot written");
    Ok(true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReportRow {
    pub task_id: String,
    pub status: TaskOutcome,
    pub g_last_update: u64,
    pub cost_record: CostRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    pub plan_id: String,
    pub g: u64,
    pub tasks: Vec<CostReportRow>,
    pub totals: CostRecord,
}

#[instrument(skip_all, fields(task_id = %task.task_id))]
pub fn generate_cost_report(
    task: &Task,
    config: &EngineConfig,
    state: &EngineState,
    _secrets: &SecretMap,
) -> Result<bool> {
    let output = first_output(task)?;
    let plan_id = state
        .cp_id
        .as_deref()
        .ok_or_else(|| EngineError::execution("no current plan in engine state"))?;
    let location = locate_plan(config, plan_id)?;
    let status = load_status(&location.status_path, plan_id)?;

    let report = CostReport {
        plan_id: plan_id.to_string(),
        g: state.g,
        tasks: status
            .tasks_status
            .iter()
            .map(|entry| CostReportRow {
                task_id: entry.task_id_ref.clone(),
                status: entry.status,
                g_last_update: entry.g_last_update,
                cost_record: entry.cost_record,
            })
            .collect(),
        totals: status.total_cost(),
    };
    let path = config.sandbox().join(output)?;
    atomic_write_with(&path, &to_json_bytes(&report)?, write_options(config))?;
    info!(rows = report.tasks.len(), usd = report.totals.usd, "cost report written");
    Ok(path.is_file())
}

#[instrument(skip_all, fields(task_id = %task.task_id))]
pub fn rotate_registry(
    task: &Task,
    config: &EngineConfig,
    _state: &EngineState,
    _secrets: &SecretMap,
) -> Result<bool> {
    let keep = match task.params.get("keep") {
        None => config.registry_history_limit,
        Some(value) => value
            .as_u64()
            .filter(|keep| *keep > 0)
            .and_then(|keep| usize::try_from(keep).ok())
            .ok_or_else(|| EngineError::execution("params.keep must be a positive integer"))?,
    };
    let archive: PathBuf = config.sandbox().join(first_output(task)?)?;
    registry::rotate_registry(&config.registry_path()?, &archive, keep)?;
    Ok(archive.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::registry::load_registry;
    use serde_json::json;

    fn task(task_type: &str, inputs: &[&str], outputs: &[&str], params: Value) -> Task {
        Task {
            task_id: "t1".to_string(),
            task_type: task_type.to_string(),
            dependencies: Vec::new(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            params,
        }
    }

    fn state(g: u64) -> EngineState {
        EngineState {
            g,
            cp_id: Some("plan-a".to_string()),
            ..EngineState::default()
        }
    }

    #[test]
    fn create_directory_makes_every_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::for_workspace(temp.path());
        let task = task(CREATE_DIRECTORY, &[], &["out/a", "out/b/c"], json!({}));

        assert!(create_directory(&task, &config, &state(0), &SecretMap::new()).expect("run"));
        assert!(temp.path().join("out/a").is_dir());
        assert!(temp.path().join("out/b/c").is_dir());
    }

    #[test]
    fn create_directory_rejects_escape() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::for_workspace(temp.path());
        let task = task(CREATE_DIRECTORY, &[], &["../outside"], json!({}));

        let err = create_directory(&task, &config, &state(0), &SecretMap::new()).unwrap_err();
        assert!(err.is_security());
    }

    #[test]
    fn template_renders_context_and_registers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::for_workspace(temp.path());
        let task = task(
            CREATE_FILE_FROM_TEMPLATE,
            &[],
            &["docs/readme.md"],
            json!({
                "template_text": "{{ plan_id }}/{{ task_id }}@{{ g }}: {{ vars.title }}",
                "vars": {"title": "Hello"},
                "artifact_id": "readme",
            }),
        );

        assert!(create_file_from_template(&task, &config, &state(4), &SecretMap::new()).expect("run"));
        let text = fs::read_to_string(temp.path().join("docs/readme.md")).expect("read");
        assert_eq!(text, "plan-a/t1@4: Hello");

        let registry = load_registry(&config.registry_path().expect("path")).expect("registry");
        assert_eq!(registry.artifacts["readme"].primary_filepath, "docs/readme.md");
        assert_eq!(registry.artifacts["readme"].g_created_in_registry, 5);
    }

    #[test]
    fn template_with_undefined_variable_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::for_workspace(temp.path());
        let task = task(
            CREATE_FILE_FROM_TEMPLATE,
            &[],
            &["out.txt"],
            json!({"template_text": "{{ vars.missing }}"}),
        );

        assert!(create_file_from_template(&task, &config, &state(1), &SecretMap::new()).is_err());
        assert!(!temp.path().join("out.txt").exists());
    }

    #[test]
    fn template_can_come_from_first_input() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("tpl.j2"), "id={{ task_id }}").expect("seed");
        let config = EngineConfig::for_workspace(temp.path());
        let task = task(CREATE_FILE_FROM_TEMPLATE, &["tpl.j2"], &["out.txt"], json!({}));

        assert!(create_file_from_template(&task, &config, &state(1), &SecretMap::new()).expect("run"));
        assert_eq!(fs::read_to_string(temp.path().join("out.txt")).expect("read"), "id=t1");
    }

    #[test]
    fn snapshot_copies_tree_and_writes_manifest() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src/nested")).expect("mkdir");
        fs::write(temp.path().join("src/a.txt"), "alpha").expect("seed");
        fs::write(temp.path().join("src/nested/b.txt"), "beta").expect("seed");
        fs::write(temp.path().join("notes.md"), "notes").expect("seed");
        let config = EngineConfig::for_workspace(temp.path());
        let task = task(CREATE_SNAPSHOT, &["src", "notes.md"], &["snap/1"], json!({}));

        assert!(create_snapshot(&task, &config, &state(2), &SecretMap::new()).expect("run"));

        let dest = temp.path().join("snap/1");
        assert_eq!(fs::read_to_string(dest.join("src/nested/b.txt")).expect("read"), "beta");
        let manifest: SnapshotManifest =
            serde_json::from_str(&fs::read_to_string(dest.join(MANIFEST_FILE)).expect("read"))
                .expect("parse");
        assert_eq!(
            manifest.files.keys().collect::<Vec<_>>(),
            vec!["notes.md", "src/a.txt", "src/nested/b.txt"]
        );
        assert_eq!(manifest.files["src/a.txt"], sha256_hex(b"alpha"));

        let registry = load_registry(&config.registry_path().expect("path")).expect("registry");
        assert_eq!(registry.artifacts["snap/1"].primary_filepath, "snap/1/manifest.json");
        assert_eq!(registry.artifacts["snap/1"].g_created_in_registry, 3);
    }

    #[test]
    fn snapshot_of_missing_input_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::for_workspace(temp.path());
        let task = task(CREATE_SNAPSHOT, &["ghost"], &["snap"], json!({}));
        assert!(create_snapshot(&task, &config, &state(1), &SecretMap::new()).is_err());
    }

    #[test]
    fn rotate_registry_rejects_zero_keep() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::for_workspace(temp.path());
        let task = task(ROTATE_REGISTRY, &[], &["archive.json"], json!({"keep": 0}));
        assert!(rotate_registry(&task, &config, &state(1), &SecretMap::new()).is_err());
    }

    #[test]
    fn rotate_registry_archives_with_default_keep() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            registry_history_limit: 1,
            ..EngineConfig::for_workspace(temp.path())
        };
        let registry_path = config.registry_path().expect("path");
        for g in 1..=3 {
            register_artifacts(&registry_path, &[ArtifactRecord::created("doc", "doc.md")], g)
                .expect("register");
        }
        let task = task(ROTATE_REGISTRY, &[], &["archive/registry.json"], json!({}));

        assert!(rotate_registry(&task, &config, &state(3), &SecretMap::new()).expect("run"));
        let current = load_registry(&registry_path).expect("current");
        assert_eq!(current.artifacts["doc"].history.len(), 1);
        let archived = load_registry(&temp.path().join("archive/registry.json")).expect("archive");
        assert_eq!(archived.artifacts["doc"].history.len(), 3);
    }
}
