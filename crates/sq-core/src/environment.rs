//! Per-instance runtime environment.
//!
//! Two engines may share a host. Each reads its instance id and runtime paths
//! from `AGENT_*` variables; when any of them is present the engine runs in
//! *isolated* mode and derives every runtime path from the variables (or from
//! `AGENT_TEMP_DIR`) instead of the configured directories.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::Config;

pub const ENV_INSTANCE_ID: &str = "AGENT_INSTANCE_ID";
pub const ENV_LOG_DIR: &str = "AGENT_LOG_DIR";
pub const ENV_TEMP_DIR: &str = "AGENT_TEMP_DIR";
pub const ENV_STATUS_FILE: &str = "AGENT_STATUS_FILE";
pub const ENV_MONITOR_LOG: &str = "AGENT_MONITOR_LOG";
pub const ENV_WORKTREE_BASE: &str = "AGENT_WORKTREE_BASE";
pub const ENV_ISOLATED: &str = "AGENT_ISOLATED";

const RECOGNIZED: [&str; 7] = [
    ENV_INSTANCE_ID,
    ENV_LOG_DIR,
    ENV_TEMP_DIR,
    ENV_STATUS_FILE,
    ENV_MONITOR_LOG,
    ENV_WORKTREE_BASE,
    ENV_ISOLATED,
];

pub const DEFAULT_INSTANCE_ID: &str = "default";

// ---------------------------------------------------------------------------
// RuntimeEnv
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeEnv {
    pub instance_id: String,
    pub isolated: bool,
    pub temp_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub monitor_log: Option<PathBuf>,
    pub worktree_base: Option<PathBuf>,
}

impl RuntimeEnv {
    /// Read the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit variable set.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| RECOGNIZED.contains(&k.as_str()))
            .collect();
        let get = |key: &str| vars.get(key).filter(|v| !v.trim().is_empty()).cloned();

        let isolated = !vars.is_empty();
        let temp_dir = get(ENV_TEMP_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        Self {
            instance_id: get(ENV_INSTANCE_ID).unwrap_or_else(|| DEFAULT_INSTANCE_ID.to_string()),
            isolated,
            temp_dir,
            log_dir: get(ENV_LOG_DIR).map(PathBuf::from),
            status_file: get(ENV_STATUS_FILE).map(PathBuf::from),
            monitor_log: get(ENV_MONITOR_LOG).map(PathBuf::from),
            worktree_base: get(ENV_WORKTREE_BASE).map(PathBuf::from),
        }
    }

    /// Non-isolated environment rooted at `temp_dir` (tests, embedding).
    pub fn local(instance_id: impl Into<String>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            instance_id: instance_id.into(),
            isolated: false,
            temp_dir: temp_dir.into(),
            log_dir: None,
            status_file: None,
            monitor_log: None,
            worktree_base: None,
        }
    }

    fn instance_file(&self, suffix: &str) -> PathBuf {
        self.temp_dir.join(format!("{}{suffix}", self.instance_id))
    }
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self::local(DEFAULT_INSTANCE_ID, std::env::temp_dir())
    }
}

// ---------------------------------------------------------------------------
// RuntimePaths
// ---------------------------------------------------------------------------

/// Fully resolved file locations for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimePaths {
    pub status_file: PathBuf,
    pub monitor_log: PathBuf,
    pub knowledge_file: PathBuf,
    pub worktree_base: PathBuf,
    pub logs_dir: PathBuf,
    pub reports_dir: PathBuf,
}

impl RuntimePaths {
    pub fn resolve(config: &Config, env: &RuntimeEnv) -> Self {
        let status_file = env
            .status_file
            .clone()
            .unwrap_or_else(|| env.instance_file("_status.json"));
        let monitor_log = env
            .monitor_log
            .clone()
            .unwrap_or_else(|| env.instance_file("_monitor.log"));

        if env.isolated {
            let logs_dir = env
                .log_dir
                .clone()
                .unwrap_or_else(|| env.instance_file("_logs"));
            Self {
                status_file,
                monitor_log,
                knowledge_file: env.instance_file("_knowledge.json"),
                worktree_base: env
                    .worktree_base
                    .clone()
                    .unwrap_or_else(|| env.instance_file("-worktrees")),
                reports_dir: logs_dir.join("reports"),
                logs_dir,
            }
        } else {
            Self {
                status_file,
                monitor_log,
                knowledge_file: config.paths.cache_dir().join("knowledge.json"),
                worktree_base: config.paths.worktrees_dir(),
                logs_dir: config.paths.logs_dir(),
                reports_dir: config.paths.reports_dir(),
            }
        }
    }
}
