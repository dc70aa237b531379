//! Plan and status document storage under the initiatives tree.
//!
//! Layout: `<initiatives_dir>/<initiative>/plans/<plan_id>/{plan.json,status.json}`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::config::EngineConfig;
use crate::core::ids::validate_id;
use crate::core::types::{Plan, PlanStatus};
use crate::error::{ConfigError, DataSafetyError, EngineError, Result};
use crate::io::atomic::{WriteOptions, atomic_write_with, read_json_shared, to_json_bytes};

const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/plan/v1.schema.json"
));
const STATUS_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/status/v1.schema.json"
));

pub const PLAN_FILE: &str = "plan.json";
pub const STATUS_FILE: &str = "status.json";

/// Where one plan's documents live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLocation {
    pub initiative: String,
    pub plan_path: PathBuf,
    pub status_path: PathBuf,
}

/// Find the single initiative that holds `plan_id`.
#[instrument(skip_all, fields(plan_id = %plan_id))]
pub fn locate_plan(config: &EngineConfig, plan_id: &str) -> Result<PlanLocation> {
    validate_id(plan_id).map_err(ConfigError::Invalid)?;
    let initiatives = config.initiatives_path()?;
    let entries = fs::read_dir(&initiatives).map_err(|err| -> EngineError {
        if err.kind() == io::ErrorKind::NotFound {
            ConfigError::NotFound(initiatives.display().to_string()).into()
        } else {
            DataSafetyError::io(&initiatives, err).into()
        }
    })?;

    let mut initiative_names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    initiative_names.sort();

    let sandbox = config.sandbox();
    let mut found = Vec::new();
    for initiative in initiative_names {
        let relative = config
            .initiatives_dir
            .join(&initiative)
            .join("plans")
            .join(plan_id);
        let plan_dir = sandbox.join_path(&relative)?;
        let plan_path = plan_dir.join(PLAN_FILE);
        if plan_path.is_file() {
            debug!(initiative = %initiative, "plan candidate");
            found.push(PlanLocation {
                initiative,
                status_path: plan_dir.join(STATUS_FILE),
                plan_path,
            });
        }
    }

    match found.len() {
        0 => Err(ConfigError::NotFound(format!(
            "plan '{plan_id}' under {}",
            initiatives.display()
        ))
        .into()),
        1 => Ok(found.remove(0)),
        _ => Err(ConfigError::Ambiguous {
            plan_id: plan_id.to_string(),
            paths: found.into_iter().map(|loc| loc.plan_path).collect(),
        }
        .into()),
    }
}

/// Load `plan.json`, validating it against the bundled schema.
pub fn load_plan(path: &Path, expected_plan_id: &str) -> Result<Plan> {
    let value: Value = read_json_shared(path)?;
    validate_schema(PLAN_SCHEMA, path, &value)?;
    let plan: Plan = serde_json::from_value(value).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    ensure_plan_id(path, &plan.plan_id, expected_plan_id)?;
    Ok(plan)
}

pub fn load_status(path: &Path, expected_plan_id: &str) -> Result<PlanStatus> {
    let value: Value = read_json_shared(path)?;
    validate_schema(STATUS_SCHEMA, path, &value)?;
    let status: PlanStatus = serde_json::from_value(value).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    ensure_plan_id(path, &status.plan_id, expected_plan_id)?;
    Ok(status)
}

/// Load `status.json`, creating and persisting a DRAFT status if absent.
#[instrument(skip_all, fields(path = %path.display(), plan_id = %plan_id))]
pub fn load_or_create_status(
    path: &Path,
    plan_id: &str,
    options: WriteOptions<'_>,
) -> Result<PlanStatus> {
    if path.exists() {
        return load_status(path, plan_id);
    }
    let status = PlanStatus::draft(plan_id);
    write_status(path, &status, options)?;
    info!("created draft status");
    Ok(status)
}

pub fn write_status(path: &Path, status: &PlanStatus, options: WriteOptions<'_>) -> Result<()> {
    atomic_write_with(path, &to_json_bytes(status)?, options)
}

fn ensure_plan_id(path: &Path, found: &str, expected: &str) -> Result<()> {
    if found == expected {
        return Ok(());
    }
    Err(ConfigError::Invalid(format!(
        "{} declares plan_id '{found}', expected '{expected}'",
        path.display()
    ))
    .into())
}

fn validate_schema(schema: &str, path: &Path, instance: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(schema)
        .map_err(|err| ConfigError::Invalid(format!("bundled schema: {err}")))?;
    let compiled = validator_for(&schema_value)
        .map_err(|err| ConfigError::Invalid(format!("bundled schema: {err}")))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        return Ok(());
    }
    Err(ConfigError::Schema {
        path: path.to_path_buf(),
        messages,
    }
    .into())
}
