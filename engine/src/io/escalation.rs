//! Durable escalation artifacts: blocker issues and the human attention queue.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tracing::{info, instrument};

use crate::core::types::{HumanAttentionQueueEntry, Issue, IssueState, IssueType, ReasonCode};
use crate::error::Result;
use crate::io::atomic::{locked_update, write_json_atomic};

/// Issue id for an escalation recorded at generation `g`.
pub fn issue_id(g: u64) -> String {
    format!("ISS-{g:08}")
}

/// Queue artifact id registered alongside an issue.
pub fn queue_artifact_id(issue_id: &str) -> String {
    format!("haq:{issue_id}")
}

pub fn new_blocker(
    g: u64,
    plan_id: &str,
    task_id: &str,
    reason: &str,
    reason_code: ReasonCode,
) -> Issue {
    Issue {
        id: issue_id(g),
        issue_type: IssueType::Blocker,
        status: IssueState::Open,
        g_created: g,
        linked_plan_id: plan_id.to_string(),
        task_id: task_id.to_string(),
        reason: reason.to_string(),
        reason_code,
    }
}

/// Persist `issue` as `<issues_dir>/<id>.json` and return the written path.
#[instrument(skip_all, fields(issue_id = %issue.id))]
pub fn write_issue(issues_dir: &Path, issue: &Issue) -> Result<PathBuf> {
    let path = issues_dir.join(format!("{}.json", issue.id));
    write_json_atomic(&path, issue, None)?;
    info!(path = %path.display(), reason_code = ?issue.reason_code, "issue written");
    Ok(path)
}

/// Queue entry for `issue`, timestamped now in UTC.
pub fn queue_entry_for(issue: &Issue) -> HumanAttentionQueueEntry {
    HumanAttentionQueueEntry {
        issue_id: issue.id.clone(),
        priority: issue.reason_code.priority(),
        reason_code: issue.reason_code,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        g_event: issue.g_created,
    }
}

/// Append one entry to the queue array under the queue's exclusive lock.
#[instrument(skip_all, fields(queue = %queue_path.display(), issue_id = %entry.issue_id))]
pub fn append_queue_entry(queue_path: &Path, entry: HumanAttentionQueueEntry) -> Result<usize> {
    let len = locked_update(queue_path, |queue: &mut Vec<HumanAttentionQueueEntry>| {
        queue.push(entry);
        Ok(queue.len())
    })?;
    info!(queue_len = len, "human attention queue updated");
    Ok(len)
}
