use std::path::Path;

use anyhow::Context;
use sq_core::config::ConfigError;
use sq_core::environment::RuntimeEnv;
use sq_core::plan::{Plan, PlanSource};
use sq_core::types::{AgentRole, Task, TaskPriority, TaskStatus, TaskType};
use sq_engine::{Engine, RunReport};
use tracing::info;

use super::{cancel_on_ctrl_c, init_logging, load_config, parse_mode, resolve_workdir, ExecArgs};

pub struct NewTask {
    pub title: String,
    pub command: Option<String>,
    pub description: String,
    pub role: Option<String>,
}

fn prepare(config_path: Option<&Path>, json_logs: bool, exec: &ExecArgs) -> anyhow::Result<Engine> {
    let mut config = load_config(config_path)?;
    if exec.simulate {
        config.execution.use_real_agents = false;
    }
    init_logging(&config, json_logs);
    let workdir = resolve_workdir(exec.workdir.as_deref())?;
    let engine = Engine::new(config, RuntimeEnv::from_env(), workdir)
        .context("failed to start engine")?
        .with_context_files(exec.context.clone());
    cancel_on_ctrl_c(engine.cancel_token());
    Ok(engine)
}

pub async fn run_request(
    config_path: Option<&Path>,
    json_logs: bool,
    request: &str,
    exec: &ExecArgs,
) -> anyhow::Result<u8> {
    let mode = parse_mode(exec.mode.as_deref())?;
    let engine = prepare(config_path, json_logs, exec)?;
    let plan = engine.plan(request).await;
    info!(tasks = plan.children().len(), source = ?plan.source, "plan ready");
    let report = engine.run_plan(plan, mode).await?;
    print_report(&report, exec.json)?;
    Ok(report.exit_code() as u8)
}

pub async fn run_task(
    config_path: Option<&Path>,
    json_logs: bool,
    new_task: NewTask,
    exec: &ExecArgs,
) -> anyhow::Result<u8> {
    let mode = parse_mode(exec.mode.as_deref())?;
    let role = new_task
        .role
        .as_deref()
        .map(|r| r.parse::<AgentRole>().map_err(ConfigError::Validation))
        .transpose()?;
    let engine = prepare(config_path, json_logs, exec)?;

    let mut task = Task::new(&new_task.title, TaskType::Development, TaskPriority::Medium)
        .with_description(new_task.description.clone());
    if let Some(command) = new_task.command {
        task = task.with_command(command);
    }
    if let Some(role) = role {
        task = task.with_assigned_to(role);
    }
    let plan = Plan::from_tasks(&new_task.title, &new_task.title, vec![task], PlanSource::Manual);
    let report = engine.run_plan(plan, mode).await?;
    print_report(&report, exec.json)?;
    Ok(report.exit_code() as u8)
}

fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "squadron run: {}  (mode {}, {:.1}s)",
        report.outcome.as_str(),
        report.mode.as_str(),
        report.elapsed.as_secs_f64()
    );
    println!("{}", "-".repeat(60));
    for task in &report.tasks {
        let marker = match task.status {
            TaskStatus::Completed => "ok",
            TaskStatus::Failed => "FAIL",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
            _ => "?",
        };
        println!("[{marker:>9}] {}  {}", task.short_id(), task.title);
        if let Some(error) = &task.error {
            println!("            {error}");
        }
    }
    println!("{}", "-".repeat(60));
    println!(
        "{} completed, {} failed, {} total",
        report.stats.completed, report.stats.failed, report.stats.total
    );
    if !report.files_modified.is_empty() {
        println!("files modified: {}", report.files_modified.join(", "));
    }
    Ok(())
}
