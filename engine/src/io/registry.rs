//! Global artifact registry shared by every plan runner and external agent.
//!
//! Every mutation is a full read-modify-write under the registry's exclusive
//! sidecar lock, so concurrent writers in separate processes never lose each
//! other's entries. Contention is reported, not retried.

use std::path::Path;

use tracing::{debug, info, instrument};

use crate::core::types::GlobalRegistry;
use crate::error::Result;
use crate::io::atomic::{atomic_write, locked_update, read_json_shared, to_json_bytes};

/// One artifact to add or touch in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    /// Workspace-relative path of the artifact's primary file.
    pub filepath: String,
    pub action: String,
}

impl ArtifactRecord {
    pub fn created(artifact_id: impl Into<String>, filepath: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            filepath: filepath.into(),
            action: "created".to_string(),
        }
    }
}

pub fn load_registry(path: &Path) -> Result<GlobalRegistry> {
    if !path.exists() {
        return Ok(GlobalRegistry::default());
    }
    read_json_shared(path)
}

/// Record every artifact in one locked transaction, stamped with generation `g`.
#[instrument(skip_all, fields(path = %path.display(), count = records.len(), g = g))]
pub fn register_artifacts(path: &Path, records: &[ArtifactRecord], g: u64) -> Result<()> {
    locked_update(path, |registry: &mut GlobalRegistry| {
        for record in records {
            registry.record(&record.artifact_id, &record.filepath, g, &record.action);
        }
        Ok(())
    })?;
    debug!("artifacts registered");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSummary {
    pub artifacts: usize,
    pub events_dropped: usize,
}

/// Archive the registry to `archive_path`, then trim each artifact's history
/// to its newest `keep` events. Both happen while holding the registry lock.
#[instrument(skip_all, fields(path = %path.display(), archive = %archive_path.display(), keep = keep))]
pub fn rotate_registry(path: &Path, archive_path: &Path, keep: usize) -> Result<RotationSummary> {
    let summary = locked_update(path, |registry: &mut GlobalRegistry| {
        atomic_write(archive_path, &to_json_bytes(registry)?, None)?;
        let mut events_dropped = 0;
        for entry in registry.artifacts.values_mut() {
            let excess = entry.history.len().saturating_sub(keep);
            entry.history.drain(..excess);
            events_dropped += excess;
        }
        Ok(RotationSummary {
            artifacts: registry.artifacts.len(),
            events_dropped,
        })
    })?;
    info!(
        artifacts = summary.artifacts,
        events_dropped = summary.events_dropped,
        "registry rotated"
    );
    Ok(summary)
}
