pub mod arsenal;
pub mod plan;
pub mod run;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::Context;
use sq_core::cancel::CancelToken;
use sq_core::config::{Config, ConfigError};
use sq_core::types::ExecutionModeKind;
use sq_telemetry::logging::LogFormat;

/// Flags shared by the commands that execute work.
#[derive(Debug, Clone, clap::Args)]
pub struct ExecArgs {
    /// Execution mode: safe, fast, parallel, redundant or auto.
    #[arg(long)]
    pub mode: Option<String>,
    /// Directory to work in (default: the current directory).
    #[arg(short = 'C', long)]
    pub workdir: Option<PathBuf>,
    /// Simulate agents instead of invoking the agent CLI.
    #[arg(long)]
    pub simulate: bool,
    /// Files whose content is added to every agent prompt.
    #[arg(long = "context", value_name = "FILE")]
    pub context: Vec<PathBuf>,
    /// Print the run report as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

/// Load the config from `path`, or the default location.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

pub fn init_logging(config: &Config, json_flag: bool) {
    let format = if json_flag || config.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    sq_telemetry::logging::init("squadron", &config.logging.level, format);
}

pub fn parse_mode(mode: Option<&str>) -> Result<Option<ExecutionModeKind>, ConfigError> {
    mode.map(|m| m.parse::<ExecutionModeKind>().map_err(ConfigError::Validation))
        .transpose()
}

pub fn resolve_workdir(workdir: Option<&Path>) -> anyhow::Result<PathBuf> {
    match workdir {
        Some(dir) => dir
            .canonicalize()
            .with_context(|| format!("working directory {}", dir.display())),
        None => std::env::current_dir().context("current directory"),
    }
}

/// Cancel `token` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received, cancelling run...");
            token.cancel();
        }
    });
}
