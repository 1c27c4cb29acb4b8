use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{AgentRole, ExecutionModeKind};

/// Top-level configuration loaded from `~/.squadron/config.toml`.
///
/// Every section rejects unknown keys so a typo fails loudly at load time
/// instead of silently falling back to a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub agent_cli: AgentCliConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `~/.squadron/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.execution.validate()?;
        self.agents.validate()?;
        self.agent_cli.validate()?;
        self.timeouts.validate()?;
        if self.runner.output_cap_bytes == 0 {
            return Err(ConfigError::Validation(
                "runner.output_cap_bytes must be at least 1".into(),
            ));
        }
        if self.status.log_tail == 0 {
            return Err(ConfigError::Validation(
                "status.log_tail must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        expand_home("~/.squadron/config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    #[serde(default = "default_mode")]
    pub default_mode: ExecutionModeKind,
    /// Upper bound on concurrently running agents; the parallel mode width.
    #[serde(default = "default_max_agents")]
    pub max_agents: u32,
    #[serde(default = "default_true")]
    pub use_real_agents: bool,
    #[serde(default = "default_safe_max_parallel")]
    pub safe_max_parallel: u32,
    #[serde(default = "default_redundant_copies")]
    pub redundant_copies: u32,
    /// Merge worktree branches back as tasks complete.
    #[serde(default = "default_true")]
    pub auto_merge: bool,
    /// Leave worktrees on disk after the run.
    #[serde(default)]
    pub keep_worktrees: bool,
    /// Commit after each successful task in fast mode.
    #[serde(default)]
    pub auto_commit: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_mode: default_mode(),
            max_agents: default_max_agents(),
            use_real_agents: true,
            safe_max_parallel: default_safe_max_parallel(),
            redundant_copies: default_redundant_copies(),
            auto_merge: true,
            keep_worktrees: false,
            auto_commit: false,
        }
    }
}

impl ExecutionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_agents == 0 {
            return Err(ConfigError::Validation(
                "execution.max_agents must be at least 1".into(),
            ));
        }
        if !(1..=2).contains(&self.safe_max_parallel) {
            return Err(ConfigError::Validation(format!(
                "execution.safe_max_parallel must be 1 or 2, got {}",
                self.safe_max_parallel
            )));
        }
        if self.redundant_copies == 0 {
            return Err(ConfigError::Validation(
                "execution.redundant_copies must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_mode() -> ExecutionModeKind {
    ExecutionModeKind::Auto
}
fn default_max_agents() -> u32 {
    5
}
fn default_safe_max_parallel() -> u32 {
    1
}
fn default_redundant_copies() -> u32 {
    2
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentToggle {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Display name override; defaults to the role name.
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for AgentToggle {
    fn default() -> Self {
        Self {
            enabled: true,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentsConfig {
    #[serde(default)]
    pub architect: AgentToggle,
    #[serde(default)]
    pub devops: AgentToggle,
    #[serde(default)]
    pub qa: AgentToggle,
    #[serde(default)]
    pub frontend: AgentToggle,
    #[serde(default)]
    pub research: AgentToggle,
}

impl AgentsConfig {
    pub fn toggle(&self, role: AgentRole) -> &AgentToggle {
        match role {
            AgentRole::Architect => &self.architect,
            AgentRole::Devops => &self.devops,
            AgentRole::Qa => &self.qa,
            AgentRole::Frontend => &self.frontend,
            AgentRole::Research => &self.research,
        }
    }

    pub fn toggle_mut(&mut self, role: AgentRole) -> &mut AgentToggle {
        match role {
            AgentRole::Architect => &mut self.architect,
            AgentRole::Devops => &mut self.devops,
            AgentRole::Qa => &mut self.qa,
            AgentRole::Frontend => &mut self.frontend,
            AgentRole::Research => &mut self.research,
        }
    }

    pub fn is_enabled(&self, role: AgentRole) -> bool {
        self.toggle(role).enabled
    }

    /// Enabled roles in roster order.
    pub fn enabled_roles(&self) -> Vec<AgentRole> {
        AgentRole::ALL
            .into_iter()
            .filter(|r| self.is_enabled(*r))
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_roles().is_empty() {
            return Err(ConfigError::Validation(
                "at least one agent must be enabled".into(),
            ));
        }
        for role in AgentRole::ALL {
            if let Some(name) = &self.toggle(role).name {
                if name.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "agents.{role}.name must not be empty"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentCliConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_task_max_turns")]
    pub task_max_turns: u32,
    #[serde(default = "default_planning_max_turns")]
    pub planning_max_turns: u32,
    /// Extra flags inserted before the prompt argument.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for AgentCliConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            task_max_turns: default_task_max_turns(),
            planning_max_turns: default_planning_max_turns(),
            extra_args: Vec::new(),
        }
    }
}

impl AgentCliConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "agent_cli.program must not be empty".into(),
            ));
        }
        if self.task_max_turns == 0 || self.planning_max_turns == 0 {
            return Err(ConfigError::Validation(
                "agent_cli max turns must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_program() -> String {
    "claude".into()
}
fn default_task_max_turns() -> u32 {
    10
}
fn default_planning_max_turns() -> u32 {
    1
}

/// Directory layout. A leading `~/` is expanded against the home directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_base")]
    pub base: String,
    #[serde(default = "default_logs")]
    pub logs: String,
    #[serde(default = "default_tasks")]
    pub tasks: String,
    #[serde(default = "default_reports")]
    pub reports: String,
    #[serde(default = "default_cache")]
    pub cache: String,
    #[serde(default = "default_worktrees")]
    pub worktrees: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base: default_base(),
            logs: default_logs(),
            tasks: default_tasks(),
            reports: default_reports(),
            cache: default_cache(),
            worktrees: default_worktrees(),
        }
    }
}

impl PathsConfig {
    pub fn base_dir(&self) -> PathBuf {
        expand_home(&self.base)
    }
    pub fn logs_dir(&self) -> PathBuf {
        expand_home(&self.logs)
    }
    pub fn tasks_dir(&self) -> PathBuf {
        expand_home(&self.tasks)
    }
    pub fn reports_dir(&self) -> PathBuf {
        expand_home(&self.reports)
    }
    pub fn cache_dir(&self) -> PathBuf {
        expand_home(&self.cache)
    }
    pub fn worktrees_dir(&self) -> PathBuf {
        expand_home(&self.worktrees)
    }

    /// Point every path below `base`.
    pub fn rooted_at(base: &Path) -> Self {
        let join = |sub: &str| base.join(sub).display().to_string();
        Self {
            base: base.display().to_string(),
            logs: join("logs"),
            tasks: join("tasks"),
            reports: join("reports"),
            cache: join("cache"),
            worktrees: join("worktrees"),
        }
    }
}

fn default_base() -> String {
    "~/.squadron".into()
}
fn default_logs() -> String {
    "~/.squadron/logs".into()
}
fn default_tasks() -> String {
    "~/.squadron/tasks".into()
}
fn default_reports() -> String {
    "~/.squadron/reports".into()
}
fn default_cache() -> String {
    "~/.squadron/cache".into()
}
fn default_worktrees() -> String {
    "~/.squadron/worktrees".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    #[serde(default = "default_task_seconds")]
    pub task_seconds: u64,
    #[serde(default = "default_planning_seconds")]
    pub planning_seconds: u64,
    /// Time between terminate and kill once a deadline passes.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            task_seconds: default_task_seconds(),
            planning_seconds: default_planning_seconds(),
            grace_seconds: default_grace_seconds(),
        }
    }
}

impl TimeoutsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.task_seconds == 0 || self.planning_seconds == 0 {
            return Err(ConfigError::Validation(
                "timeouts must be at least 1 second".into(),
            ));
        }
        Ok(())
    }
}

fn default_task_seconds() -> u64 {
    600
}
fn default_planning_seconds() -> u64 {
    30
}
fn default_grace_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Per-stream capture cap.
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            output_cap_bytes: default_output_cap(),
        }
    }
}

fn default_output_cap() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusConfig {
    #[serde(default = "default_log_tail")]
    pub log_tail: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            log_tail: default_log_tail(),
        }
    }
}

fn default_log_tail() -> usize {
    200
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
