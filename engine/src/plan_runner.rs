//! Plan runner: load, order, guard, dispatch, persist and escalate.
//!
//! One runner drives one plan sequentially. The status document is persisted
//! atomically after every task outcome, so a crash at any point leaves a
//! complete status file and a re-run resumes after the last DONE task.
//!
//! State machine:
//!
//! ```text
//! LOADING -> READY -> EXECUTING(task) -> EXECUTING(next) | ESCALATED | COMPLETED | HALTED
//! LOADING -> LOAD_FAILED
//! ```

use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use crate::config::{EngineConfig, IntegrityMode, ReadinessPolicy};
use crate::core::planner::topological_sort;
use crate::core::types::{
    CostRecord, Phase, PlanStatus, ReasonCode, RunStatus, Task, TaskOutcome, TaskStatusEntry,
};
use crate::error::{EngineError, Result, SecurityError};
use crate::executor::TaskExecutor;
use crate::io::atomic::WriteOptions;
use crate::io::cost::CostMeter;
use crate::io::escalation::{
    append_queue_entry, new_blocker, queue_artifact_id, queue_entry_for, write_issue,
};
use crate::io::plan_store::{
    PlanLocation, load_or_create_status, load_plan, locate_plan, write_status,
};
use crate::io::registry::{ArtifactRecord, register_artifacts};
use crate::io::signing::verify_signature;
use crate::io::state::{EngineState, StateManager};
use crate::io::vault::{Vault, scoped_secrets};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerState {
    Loading,
    Ready,
    Executing { task_id: String },
    Completed,
    Escalated,
    Halted,
    LoadFailed,
}

/// How a run ended when no error escaped it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        executed: usize,
        skipped: usize,
    },
    Escalated {
        issue_id: String,
        task_id: String,
        reason_code: ReasonCode,
    },
    /// The kill switch fired before `before_task` started.
    Halted { before_task: String },
}

/// Status document plus what is needed to persist it.
#[derive(Debug)]
struct StatusDoc {
    location: PlanLocation,
    status: PlanStatus,
    signing_key: Option<Vec<u8>>,
    allow_non_atomic_fallback: bool,
}

impl StatusDoc {
    fn persist(&self) -> Result<()> {
        write_status(
            &self.location.status_path,
            &self.status,
            WriteOptions {
                signing_key: self.signing_key.as_deref(),
                allow_non_atomic_fallback: self.allow_non_atomic_fallback,
            },
        )
    }
}

#[derive(Debug)]
struct LoadedPlan {
    /// Tasks in execution order.
    tasks: Vec<Task>,
    doc: StatusDoc,
}

pub struct PlanRunner<S, C, V> {
    config: EngineConfig,
    plan_id: String,
    state_manager: S,
    cost_meter: C,
    vault: V,
    executor: TaskExecutor,
    runner_state: RunnerState,
    loaded: Option<LoadedPlan>,
}

impl<S, C, V> PlanRunner<S, C, V>
where
    S: StateManager,
    C: CostMeter,
    V: Vault,
{
    pub fn new(
        config: EngineConfig,
        plan_id: impl Into<String>,
        state_manager: S,
        cost_meter: C,
        vault: V,
    ) -> Self {
        Self {
            config,
            plan_id: plan_id.into(),
            state_manager,
            cost_meter,
            vault,
            executor: TaskExecutor::with_builtin_handlers(),
            runner_state: RunnerState::Loading,
            loaded: None,
        }
    }

    /// Replace the built-in handler table.
    pub fn with_executor(mut self, executor: TaskExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn state(&self) -> &RunnerState {
        &self.runner_state
    }

    pub fn status(&self) -> Option<&PlanStatus> {
        self.loaded.as_ref().map(|loaded| &loaded.doc.status)
    }

    /// Task ids in the order they will be considered.
    pub fn execution_order(&self) -> Option<Vec<&str>> {
        self.loaded
            .as_ref()
            .map(|loaded| loaded.tasks.iter().map(|task| task.task_id.as_str()).collect())
    }

    /// Locate, validate and order the plan. Nothing executes on failure.
    #[instrument(skip_all, fields(plan_id = %self.plan_id))]
    pub fn load(&mut self) -> Result<()> {
        self.runner_state = RunnerState::Loading;
        match self.try_load() {
            Ok(loaded) => {
                info!(tasks = loaded.tasks.len(), "plan loaded");
                self.loaded = Some(loaded);
                self.runner_state = RunnerState::Ready;
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "plan load failed");
                self.runner_state = RunnerState::LoadFailed;
                Err(err)
            }
        }
    }

    fn try_load(&self) -> Result<LoadedPlan> {
        let location = locate_plan(&self.config, &self.plan_id)?;
        let signing_key = self
            .vault
            .secret_value(&self.config.signing_secret)?
            .map(String::into_bytes);
        let verify_key = match self.config.integrity {
            IntegrityMode::Off => None,
            IntegrityMode::Strict => Some(signing_key.clone().ok_or_else(|| {
                SecurityError::MissingSigningKey(self.config.signing_secret.clone())
            })?),
        };

        if let Some(key) = &verify_key {
            verify_signature(&location.plan_path, key)?;
        }
        let plan = load_plan(&location.plan_path, &self.plan_id)?;
        let tasks: Vec<Task> = topological_sort(&plan.tasks)?.into_iter().cloned().collect();

        if let Some(key) = &verify_key {
            if location.status_path.exists() {
                verify_signature(&location.status_path, key)?;
            }
        }
        let options = WriteOptions {
            signing_key: signing_key.as_deref(),
            allow_non_atomic_fallback: self.config.allow_non_atomic_fallback,
        };
        let status = load_or_create_status(&location.status_path, &self.plan_id, options)?;

        self.bind_plan_to_state()?;

        Ok(LoadedPlan {
            tasks,
            doc: StatusDoc {
                location,
                status,
                signing_key,
                allow_non_atomic_fallback: self.config.allow_non_atomic_fallback,
            },
        })
    }

    fn bind_plan_to_state(&self) -> Result<()> {
        let state = self.state_manager.read_state()?;
        if state.cp_id.as_deref() == Some(self.plan_id.as_str()) {
            return Ok(());
        }
        let payload = EngineState {
            cp_id: Some(self.plan_id.clone()),
            ..state.clone()
        };
        self.state_manager.write_state(&payload, state.version)?;
        debug!("current plan recorded in engine state");
        Ok(())
    }

    /// Run the plan to a terminal state, loading it first if needed.
    pub fn run(&mut self) -> Result<RunOutcome> {
        if self.loaded.is_none() {
            self.load()?;
        }
        let Some(mut loaded) = self.loaded.take() else {
            return Err(EngineError::execution("plan not loaded"));
        };
        let outcome = self.run_loaded(&loaded.tasks, &mut loaded.doc);
        self.loaded = Some(loaded);
        outcome
    }

    /// `true` only if every task is DONE at the end of the run.
    pub fn execute(&mut self) -> Result<bool> {
        Ok(matches!(self.run()?, RunOutcome::Completed { .. }))
    }

    #[instrument(skip_all, fields(plan_id = %self.plan_id))]
    fn run_loaded(&mut self, tasks: &[Task], doc: &mut StatusDoc) -> Result<RunOutcome> {
        doc.status.status = RunStatus::Running;
        doc.status.status_details.phase = Phase::Executing;
        doc.status.status_details.failed_task = None;
        doc.status.status_details.reason = None;
        doc.persist()?;

        let mut executed = 0;
        let mut skipped = 0;
        for task in tasks {
            if doc.status.is_done(&task.task_id) {
                debug!(task_id = %task.task_id, "already done, skipping");
                skipped += 1;
                continue;
            }

            if let Some(trigger) = self.kill_switch_trigger()? {
                warn!(task_id = %task.task_id, trigger = %trigger, "kill switch engaged, halting");
                doc.status.status_details.phase = Phase::Halted;
                doc.status.status_details.reason = Some(format!("kill switch: {trigger}"));
                doc.persist()?;
                self.runner_state = RunnerState::Halted;
                return Ok(RunOutcome::Halted {
                    before_task: task.task_id.clone(),
                });
            }

            match self.cost_meter.check_budget() {
                Ok(()) => {}
                Err(EngineError::BudgetExceeded(reason)) => {
                    return self.escalate(doc, task, ReasonCode::BudgetExceeded, reason);
                }
                Err(err) => return Err(err),
            }

            let missing = self.missing_inputs(task)?;
            if !missing.is_empty() {
                let reason = format!("missing inputs: {}", missing.join(", "));
                match self.config.readiness_policy() {
                    ReadinessPolicy::Enforce => {
                        return self.escalate(doc, task, ReasonCode::MissingInputs, reason);
                    }
                    ReadinessPolicy::Warn => {
                        warn!(task_id = %task.task_id, %reason, "dispatching despite missing inputs");
                    }
                }
            }

            if !self.execute_task(task, doc)? {
                let reason = format!("{} handler reported failure", task.task_type);
                return self.escalate(doc, task, ReasonCode::TaskFailed, reason);
            }
            executed += 1;
        }

        doc.status.status = RunStatus::Done;
        doc.status.status_details.phase = Phase::Completed;
        doc.persist()?;
        self.runner_state = RunnerState::Completed;
        info!(executed, skipped, "plan completed");
        Ok(RunOutcome::Completed { executed, skipped })
    }

    /// Dispatch one task and, on success, record it DONE with its cost.
    #[instrument(skip_all, fields(task_id = %task.task_id, task_type = %task.task_type))]
    fn execute_task(&mut self, task: &Task, doc: &mut StatusDoc) -> Result<bool> {
        self.runner_state = RunnerState::Executing {
            task_id: task.task_id.clone(),
        };
        self.state_manager.set_current_task(&task.task_id)?;
        let state = self.state_manager.read_state()?;
        let secrets = scoped_secrets(&self.vault.list_secrets()?, task);

        let started = Instant::now();
        let done = self
            .executor
            .dispatch(task, &self.config, &state, &secrets)?;
        let elapsed = started.elapsed().as_secs_f64();
        if !done {
            return Ok(false);
        }

        let g = self.state_manager.increment_g_and_write()?;
        let cost = CostRecord {
            cpu_seconds: elapsed,
            mem_bytes: 0,
            tokens: 0,
            usd: elapsed * self.config.budget.usd_per_cpu_second,
        };
        doc.status.upsert(TaskStatusEntry {
            task_id_ref: task.task_id.clone(),
            status: TaskOutcome::Done,
            g_last_update: g,
            cost_record: cost,
        });
        doc.persist()?;
        self.cost_meter.record_task_cost(&cost);
        info!(g, elapsed_secs = elapsed, "task done");
        Ok(true)
    }

    fn missing_inputs(&self, task: &Task) -> Result<Vec<String>> {
        let sandbox = self.config.sandbox();
        let mut missing = Vec::new();
        for input in &task.inputs {
            if !sandbox.join(input)?.exists() {
                missing.push(input.clone());
            }
        }
        Ok(missing)
    }

    fn kill_switch_trigger(&self) -> Result<Option<String>> {
        for file in &self.config.kill_switch_files {
            if self.config.resolve(file)?.exists() {
                return Ok(Some(file.display().to_string()));
            }
        }
        if let Some(var) = &self.config.kill_switch_env {
            if std::env::var_os(var).is_some_and(|value| !value.is_empty()) {
                return Ok(Some(format!("${var}")));
            }
        }
        Ok(None)
    }

    /// Take a new generation, record the failure under it, then create the
    /// issue, queue entry and registry entries. Each step is durable before
    /// the next one starts.
    #[instrument(skip_all, fields(task_id = %task.task_id, reason_code = ?reason_code))]
    fn escalate(
        &mut self,
        doc: &mut StatusDoc,
        task: &Task,
        reason_code: ReasonCode,
        reason: String,
    ) -> Result<RunOutcome> {
        // The FAILED outcome and its issue share one generation.
        let g = self.state_manager.increment_g_and_write()?;
        doc.status.status = RunStatus::Failed;
        doc.status.status_details.phase = Phase::Blocked;
        doc.status.status_details.failed_task = Some(task.task_id.clone());
        doc.status.status_details.reason = Some(reason.clone());
        doc.status.upsert(TaskStatusEntry {
            task_id_ref: task.task_id.clone(),
            status: TaskOutcome::Failed,
            g_last_update: g,
            cost_record: CostRecord::default(),
        });
        doc.persist()?;

        let issue = new_blocker(g, &self.plan_id, &task.task_id, &reason, reason_code);
        let issue_path = write_issue(&self.config.issues_path()?, &issue)?;

        let queue_path = self.config.queue_path()?;
        append_queue_entry(&queue_path, queue_entry_for(&issue))?;

        let sandbox = self.config.sandbox();
        register_artifacts(
            &self.config.registry_path()?,
            &[
                ArtifactRecord::created(&issue.id, sandbox.relative(&issue_path)),
                ArtifactRecord::created(queue_artifact_id(&issue.id), sandbox.relative(&queue_path)),
            ],
            g,
        )?;

        self.runner_state = RunnerState::Escalated;
        error!(issue_id = %issue.id, %reason, "run escalated");
        Ok(RunOutcome::Escalated {
            issue_id: issue.id,
            task_id: task.task_id.clone(),
            reason_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::io::cost::BudgetMeter;
    use crate::io::state::FileStateManager;
    use crate::io::vault::MemoryVault;
    use crate::test_support::{Workspace, task};

    fn runner(ws: &Workspace, plan_id: &str) -> PlanRunner<FileStateManager, BudgetMeter, MemoryVault> {
        PlanRunner::new(
            ws.config.clone(),
            plan_id,
            ws.state_manager(),
            BudgetMeter::new(ws.config.budget.clone()),
            MemoryVault::new(),
        )
    }

    #[test]
    fn load_orders_tasks_and_binds_state() {
        let ws = Workspace::new();
        ws.write_plan(
            "alpha",
            "p1",
            &[
                task("b", "CREATE_DIRECTORY").depends_on(&["a"]).outputs(&["out/b"]),
                task("a", "CREATE_DIRECTORY").outputs(&["out/a"]),
            ],
        );

        let mut runner = runner(&ws, "p1");
        runner.load().expect("load");
        assert_eq!(runner.state(), &RunnerState::Ready);
        assert_eq!(runner.execution_order(), Some(vec!["a", "b"]));
        assert_eq!(
            ws.state_manager().read_state().expect("state").cp_id.as_deref(),
            Some("p1")
        );
    }

    #[test]
    fn cycle_fails_load_before_status_exists() {
        let ws = Workspace::new();
        ws.write_plan(
            "alpha",
            "p1",
            &[
                task("a", "CREATE_DIRECTORY").depends_on(&["b"]),
                task("b", "CREATE_DIRECTORY").depends_on(&["a"]),
            ],
        );

        let mut runner = runner(&ws, "p1");
        assert!(matches!(runner.load(), Err(EngineError::Planner(_))));
        assert_eq!(runner.state(), &RunnerState::LoadFailed);
        assert!(!ws.status_path("alpha", "p1").exists());
    }

    #[test]
    fn spent_budget_escalates_before_first_task() {
        let ws = Workspace::new();
        ws.write_plan("alpha", "p1", &[task("a", "CREATE_DIRECTORY").outputs(&["out"])]);
        let mut meter = BudgetMeter::new(BudgetConfig {
            max_usd: Some(0.5),
            ..BudgetConfig::default()
        });
        meter.record_task_cost(&CostRecord {
            usd: 1.0,
            ..CostRecord::default()
        });

        let outcome = PlanRunner::new(
            ws.config.clone(),
            "p1",
            ws.state_manager(),
            meter,
            MemoryVault::new(),
        )
        .run()
        .expect("run");
        assert!(matches!(
            outcome,
            RunOutcome::Escalated {
                reason_code: ReasonCode::BudgetExceeded,
                ..
            }
        ));
        assert!(!ws.root().join("out").exists());
    }

    #[test]
    fn strict_integrity_without_key_is_a_security_error() {
        let mut ws = Workspace::new();
        ws.config.integrity = IntegrityMode::Strict;
        ws.write_plan("alpha", "p1", &[]);

        let err = runner(&ws, "p1").load().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Security(SecurityError::MissingSigningKey(_))
        ));
    }
}
