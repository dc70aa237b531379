//! `plan-engine` command-line driver.
//!
//! Thin wrapper over the library: loads `plan-engine.toml`, wires the
//! reference state manager, budget meter and vault, and maps results to
//! stable exit codes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use plan_engine::config::{EngineConfig, load_config};
use plan_engine::core::planner::topological_sort;
use plan_engine::error::{EngineError, SecurityError};
use plan_engine::exit_codes;
use plan_engine::io::cost::BudgetMeter;
use plan_engine::io::plan_store::{load_plan, load_status, locate_plan};
use plan_engine::io::signing::{sign_existing, verify_signature};
use plan_engine::io::state::FileStateManager;
use plan_engine::io::vault::{EnvVault, JsonVault, Vault};
use plan_engine::logging;
use plan_engine::plan_runner::{PlanRunner, RunOutcome};

#[derive(Parser)]
#[command(
    name = "plan-engine",
    version,
    about = "Deterministic, crash-safe plan execution engine"
)]
struct Cli {
    /// Engine config file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "plan-engine.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a plan until it completes, escalates or is halted.
    Run {
        #[arg(long)]
        plan_id: String,
    },
    /// Print a plan's task ids in execution order.
    Order {
        #[arg(long)]
        plan_id: String,
    },
    /// Write a `.sig` sidecar for a document using the configured signing secret.
    Sign { file: PathBuf },
    /// Check a document against its `.sig` sidecar.
    Verify { file: PathBuf },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            err.downcast_ref::<EngineError>()
                .map_or(exit_codes::INVALID, exit_codes::for_error)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    match cli.command {
        Command::Run { plan_id } => cmd_run(config, &plan_id),
        Command::Order { plan_id } => cmd_order(&config, &plan_id),
        Command::Sign { file } => cmd_sign(&config, &file),
        Command::Verify { file } => cmd_verify(&config, &file),
    }
}

fn vault_for(config: &EngineConfig) -> Result<Box<dyn Vault>> {
    Ok(match &config.vault_file {
        Some(path) => Box::new(JsonVault::new(config.resolve(path)?)),
        None => Box::new(EnvVault),
    })
}

fn signing_key(config: &EngineConfig) -> Result<Vec<u8>> {
    let secret = vault_for(config)?
        .secret_value(&config.signing_secret)
        .map_err(EngineError::from)?
        .ok_or_else(|| {
            EngineError::from(SecurityError::MissingSigningKey(
                config.signing_secret.clone(),
            ))
        })?;
    Ok(secret.into_bytes())
}

/// Budget meter seeded with the costs a previous run already recorded.
fn budget_meter(config: &EngineConfig, plan_id: &str) -> Result<BudgetMeter> {
    let location = locate_plan(config, plan_id)?;
    if !location.status_path.exists() {
        return Ok(BudgetMeter::new(config.budget.clone()));
    }
    let status = load_status(&location.status_path, plan_id)?;
    Ok(BudgetMeter::resuming(config.budget.clone(), &status))
}

fn cmd_run(config: EngineConfig, plan_id: &str) -> Result<i32> {
    let state = FileStateManager::new(config.state_path()?);
    let meter = budget_meter(&config, plan_id)?;
    let vault = vault_for(&config)?;
    let mut runner = PlanRunner::new(config, plan_id, state, meter, vault);

    let outcome = runner.run()?;
    match &outcome {
        RunOutcome::Completed { executed, skipped } => {
            println!("completed: {executed} executed, {skipped} skipped");
        }
        RunOutcome::Escalated {
            issue_id,
            task_id,
            reason_code,
        } => {
            println!("escalated: task {task_id} ({reason_code:?}), issue {issue_id}");
        }
        RunOutcome::Halted { before_task } => {
            println!("halted before task {before_task}");
        }
    }
    Ok(exit_codes::for_outcome(&outcome))
}

fn cmd_order(config: &EngineConfig, plan_id: &str) -> Result<i32> {
    let location = locate_plan(config, plan_id)?;
    let plan = load_plan(&location.plan_path, plan_id)?;
    for task in topological_sort(&plan.tasks).map_err(EngineError::from)? {
        println!("{}", task.task_id);
    }
    Ok(exit_codes::OK)
}

fn cmd_sign(config: &EngineConfig, file: &Path) -> Result<i32> {
    if !file.is_file() {
        return Err(anyhow!("{} is not a file", file.display()));
    }
    sign_existing(file, &signing_key(config)?)?;
    println!("signed {}", file.display());
    Ok(exit_codes::OK)
}

fn cmd_verify(config: &EngineConfig, file: &Path) -> Result<i32> {
    verify_signature(file, &signing_key(config)?).map_err(EngineError::from)?;
    println!("signature ok: {}", file.display());
    Ok(exit_codes::OK)
}
