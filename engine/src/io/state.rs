//! Shared engine state: the generation counter and the current plan pointer.
//!
//! The engine never owns this state. A [`StateManager`] is injected into the
//! plan runner; [`FileStateManager`] is the reference implementation backed by
//! a JSON file under sidecar locks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{DataSafetyError, Result};
use crate::io::atomic::{locked_update, read_json_shared};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineState {
    /// Generation counter; only ever increases.
    pub g: u64,
    /// Plan currently bound to this state.
    pub cp_id: Option<String>,
    /// Bumped on every write, used for optimistic concurrency.
    pub version: u64,
    pub current_task: Option<String>,
    /// Fields owned by other collaborators, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

pub trait StateManager {
    fn read_state(&self) -> Result<EngineState>;

    /// Atomically bump `g` and return the new value.
    fn increment_g_and_write(&self) -> Result<u64>;

    /// Replace the state if its version still equals `expected_version`.
    ///
    /// `g` in `payload` can never move the counter backwards. Returns the
    /// stored state, including its new version.
    fn write_state(&self, payload: &EngineState, expected_version: u64) -> Result<EngineState>;

    fn set_current_task(&self, task_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileStateManager {
    path: PathBuf,
}

impl FileStateManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateManager for FileStateManager {
    fn read_state(&self) -> Result<EngineState> {
        if !self.path.exists() {
            return Ok(EngineState::default());
        }
        read_json_shared(&self.path)
    }

    fn increment_g_and_write(&self) -> Result<u64> {
        let g = locked_update(&self.path, |state: &mut EngineState| {
            state.g += 1;
            state.version += 1;
            Ok(state.g)
        })?;
        debug!(g, "generation advanced");
        Ok(g)
    }

    fn write_state(&self, payload: &EngineState, expected_version: u64) -> Result<EngineState> {
        locked_update(&self.path, |state: &mut EngineState| {
            if state.version != expected_version {
                return Err(DataSafetyError::VersionConflict {
                    expected: expected_version,
                    found: state.version,
                }
                .into());
            }
            let mut next = payload.clone();
            next.g = state.g.max(payload.g);
            next.version = state.version + 1;
            *state = next.clone();
            Ok(next)
        })
    }

    fn set_current_task(&self, task_id: &str) -> Result<()> {
        locked_update(&self.path, |state: &mut EngineState| {
            state.current_task = Some(task_id.to_string());
            state.version += 1;
            Ok(())
        })
    }
}
