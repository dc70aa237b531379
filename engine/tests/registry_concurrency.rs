//! Multi-writer safety of the registry and the human attention queue.
//!
//! Each writer is a separate process: the test binary re-runs itself with
//! `writer_process` as the only selected test, told what to write through
//! environment variables. Writers retry on [`DataSafetyError::WriteConflict`]
//! themselves since the engine never waits for a lock.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use plan_engine::core::types::ReasonCode;
use plan_engine::error::{DataSafetyError, EngineError, Result};
use plan_engine::io::escalation::{append_queue_entry, new_blocker, queue_entry_for};
use plan_engine::io::registry::{ArtifactRecord, load_registry, register_artifacts};
use plan_engine::test_support::Workspace;

const WRITERS: usize = 5;
const ROUNDS: usize = 4;

const ROLE_VAR: &str = "PLAN_ENGINE_TEST_WRITER_ROLE";
const TARGET_VAR: &str = "PLAN_ENGINE_TEST_WRITER_TARGET";
const START_VAR: &str = "PLAN_ENGINE_TEST_WRITER_START";
const INDEX_VAR: &str = "PLAN_ENGINE_TEST_WRITER_INDEX";

fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> T {
    loop {
        match op() {
            Err(EngineError::DataSafety(DataSafetyError::WriteConflict { .. })) => {
                thread::sleep(Duration::from_millis(2));
            }
            other => return other.expect("non-conflict result"),
        }
    }
}

fn generation(index: usize, round: usize) -> u64 {
    (index * ROUNDS + round + 1) as u64
}

fn wait_for(start: &Path) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !start.exists() {
        assert!(Instant::now() < deadline, "writers were never released");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Child-process entry point. A no-op unless spawned by [`run_writers`].
#[test]
fn writer_process() {
    let Ok(role) = env::var(ROLE_VAR) else {
        return;
    };
    let target = PathBuf::from(env::var(TARGET_VAR).expect("target"));
    let index: usize = env::var(INDEX_VAR).expect("index").parse().expect("index");
    wait_for(Path::new(&env::var(START_VAR).expect("start")));

    for round in 0..ROUNDS {
        let g = generation(index, round);
        match role.as_str() {
            "registry" => {
                let record = ArtifactRecord::created(
                    format!("artifact-{index}-{round}"),
                    format!("out/{index}/{round}.md"),
                );
                with_retry(|| register_artifacts(&target, std::slice::from_ref(&record), g));
            }
            "queue" => {
                let issue = new_blocker(
                    g,
                    "p1",
                    &format!("t{index}"),
                    "boom",
                    ReasonCode::TaskFailed,
                );
                with_retry(|| append_queue_entry(&target, queue_entry_for(&issue)));
            }
            other => panic!("unknown writer role {other}"),
        }
    }
}

/// Spawn [`WRITERS`] processes that all start writing `target` at once.
fn run_writers(ws: &Workspace, role: &str, target: &Path) {
    let exe = env::current_exe().expect("test binary");
    let start = ws.root().join(format!("{role}.start"));

    let children: Vec<_> = (0..WRITERS)
        .map(|index| {
            Command::new(&exe)
                .args(["writer_process", "--exact", "--nocapture", "--test-threads=1"])
                .env(ROLE_VAR, role)
                .env(TARGET_VAR, target)
                .env(START_VAR, &start)
                .env(INDEX_VAR, index.to_string())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .expect("spawn writer")
        })
        .collect();
    ws.write_file(&format!("{role}.start"), "go\n");

    for child in children {
        let output = child.wait_with_output().expect("wait writer");
        assert!(
            output.status.success(),
            "writer failed: {}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

#[test]
fn concurrent_registrant_processes_never_lose_entries() {
    let ws = Workspace::new();
    let registry_path = ws.config.registry_path().expect("registry path");

    run_writers(&ws, "registry", &registry_path);

    let registry = load_registry(&registry_path).expect("load");
    assert_eq!(registry.artifacts.len(), WRITERS * ROUNDS);
    for index in 0..WRITERS {
        for round in 0..ROUNDS {
            let entry = &registry.artifacts[&format!("artifact-{index}-{round}")];
            assert_eq!(entry.primary_filepath, format!("out/{index}/{round}.md"));
            assert_eq!(entry.g_created_in_registry, generation(index, round));
        }
    }
}

#[test]
fn concurrent_queue_appender_processes_keep_every_entry() {
    let ws = Workspace::new();
    let queue_path = ws.config.queue_path().expect("queue path");

    run_writers(&ws, "queue", &queue_path);

    let mut ids: Vec<String> = ws.queue().into_iter().map(|entry| entry.issue_id).collect();
    ids.sort();
    assert_eq!(
        ids,
        (1..=WRITERS * ROUNDS)
            .map(|g| format!("ISS-{g:08}"))
            .collect::<Vec<_>>()
    );
}
