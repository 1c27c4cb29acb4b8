//! Per-run wiring: configuration, runtime paths, agents, analyzer and modes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sq_agents::agent::{roster_from_config, Agent};
use sq_agents::analyzer::{recommend_mode, AnalyzerSettings, TaskAnalyzer};
use sq_agents::arsenal::Arsenal;
use sq_agents::knowledge::KnowledgeBus;
use sq_agents::runner::{CommandRunner, ProcessRunner};
use sq_core::cancel::CancelToken;
use sq_core::config::{Config, ConfigError};
use sq_core::environment::{RuntimeEnv, RuntimePaths};
use sq_core::plan::Plan;
use sq_core::status::{EventLog, StatusWriter};
use sq_core::types::ExecutionModeKind;
use sq_core::worktree::{GitRunner, RealGitRunner, WorktreeManager};
use thiserror::Error;
use tracing::{info, warn, Instrument};

use crate::coordinator::{Coordinator, CoordinatorError, RunReport};
use crate::modes::build_mode;
use crate::report;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level git directory containing `dir`, if any.
pub fn detect_repository(dir: &Path) -> Option<PathBuf> {
    match RealGitRunner.run_git(dir, &["rev-parse", "--show-toplevel"]) {
        Ok(out) if out.success => {
            let top = out.stdout.trim();
            (!top.is_empty()).then(|| PathBuf::from(top))
        }
        _ => None,
    }
}

/// One engine per invocation. Owns everything a run needs; nothing is global.
pub struct Engine {
    config: Config,
    env: RuntimeEnv,
    paths: RuntimePaths,
    workdir: PathBuf,
    bus: Arc<KnowledgeBus>,
    arsenal: Arc<Arsenal>,
    analyzer: TaskAnalyzer,
    roster: Vec<Arc<Agent>>,
    worktrees: Option<Arc<WorktreeManager>>,
    context_files: Vec<PathBuf>,
    cancel: CancelToken,
}

impl Engine {
    /// Build an engine that runs real subprocesses and probes the host's tools.
    pub fn new(config: Config, env: RuntimeEnv, workdir: impl Into<PathBuf>) -> Result<Self> {
        let runner = ProcessRunner::new()
            .with_output_cap(config.runner.output_cap_bytes)
            .with_grace(Duration::from_secs(config.timeouts.grace_seconds));
        Self::with_parts(config, env, workdir, Arc::new(runner), Arc::new(Arsenal::probe()))
    }

    /// Build an engine around a specific runner and arsenal.
    pub fn with_parts(
        config: Config,
        env: RuntimeEnv,
        workdir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        arsenal: Arc<Arsenal>,
    ) -> Result<Self> {
        config.validate()?;
        let workdir = workdir.into();
        let paths = RuntimePaths::resolve(&config, &env);
        let bus = Arc::new(KnowledgeBus::persistent(&paths.knowledge_file));
        let analyzer = TaskAnalyzer::new(Arc::clone(&runner), AnalyzerSettings::from_config(&config));
        let roster = roster_from_config(&config, runner, Arc::clone(&bus), Arc::clone(&arsenal));
        let worktrees = detect_repository(&workdir)
            .map(|repo| Arc::new(WorktreeManager::new(repo, &paths.worktree_base)));
        info!(
            instance = %env.instance_id,
            isolated = env.isolated,
            agents = roster.len(),
            git = worktrees.is_some(),
            workdir = %workdir.display(),
            "engine ready"
        );
        Ok(Self {
            config,
            env,
            paths,
            workdir,
            bus,
            arsenal,
            analyzer,
            roster,
            worktrees,
            context_files: Vec::new(),
            cancel: CancelToken::new(),
        })
    }

    /// Files whose content is inlined into every agent prompt.
    pub fn with_context_files(mut self, files: Vec<PathBuf>) -> Self {
        self.context_files = files;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn bus(&self) -> &Arc<KnowledgeBus> {
        &self.bus
    }

    pub fn arsenal(&self) -> &Arsenal {
        &self.arsenal
    }

    pub fn roster(&self) -> &[Arc<Agent>] {
        &self.roster
    }

    pub fn has_git(&self) -> bool {
        self.worktrees.is_some()
    }

    /// Cancelling this token stops the current run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn plan(&self, request: &str) -> Plan {
        self.analyzer.analyze(request, &self.cancel).await
    }

    /// Explicit override, then the configured default; `auto` is resolved
    /// from the plan.
    pub fn select_mode(&self, plan: &Plan, requested: Option<ExecutionModeKind>) -> ExecutionModeKind {
        match requested.unwrap_or(self.config.execution.default_mode) {
            ExecutionModeKind::Auto => recommend_mode(plan),
            mode => mode,
        }
    }

    pub async fn run_request(&self, request: &str, mode: Option<ExecutionModeKind>) -> Result<RunReport> {
        let plan = self.plan(request).await;
        self.run_plan(plan, mode).await
    }

    pub async fn run_plan(&self, plan: Plan, mode: Option<ExecutionModeKind>) -> Result<RunReport> {
        let kind = self.select_mode(&plan, mode);
        let run_id = sq_telemetry::spans::generate_run_id();
        let span = sq_telemetry::spans::run_span(&run_id, &self.env.instance_id, kind.as_str());
        self.execute(plan, kind).instrument(span).await
    }

    async fn execute(&self, plan: Plan, kind: ExecutionModeKind) -> Result<RunReport> {
        info!(plan_id = %plan.id, source = ?plan.source, tasks = plan.children().len(), "running plan");
        let mode = build_mode(kind, &self.config, self.worktrees.clone(), &self.roster);
        let coordinator = Coordinator::new(mode, self.roster.clone(), Arc::clone(&self.bus))
            .with_cancel(self.cancel.clone())
            .with_workdir(&self.workdir)
            .with_context_files(self.context_files.clone())
            .with_status(self.status_writer());

        let report = coordinator.run(plan).await?;
        match report::write_session(&self.paths.reports_dir, &report, &self.env.instance_id).await {
            Ok(_) => {}
            Err(e) => warn!(dir = %self.paths.reports_dir.display(), error = %e, "failed to write session report"),
        }
        Ok(report)
    }

    fn status_writer(&self) -> StatusWriter {
        let writer = StatusWriter::new(&self.paths.status_file, &self.env.instance_id)
            .with_tail(self.config.status.log_tail);
        match EventLog::open(&self.paths.monitor_log) {
            Ok(log) => writer.with_event_log(log),
            Err(e) => {
                warn!(path = %self.paths.monitor_log.display(), error = %e, "event log unavailable");
                writer
            }
        }
    }
}
