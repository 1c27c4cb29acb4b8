mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use sq_core::config::ConfigError;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Exit code for configuration and usage errors.
const EXIT_CONFIG: u8 = 2;

/// squadron -- plan a request and run it with a squad of agent CLIs.
#[derive(Parser)]
#[command(name = "sq", version, about)]
struct Cli {
    /// Config file (default: ~/.squadron/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a request and execute the plan.
    Run {
        /// What to build, in plain language.
        request: String,
        #[command(flatten)]
        exec: commands::ExecArgs,
    },

    /// Run a single task without planning.
    Task {
        /// Task title.
        title: String,
        /// Shell command to run instead of an agent.
        #[arg(long)]
        command: Option<String>,
        /// Longer description handed to the agent.
        #[arg(long, default_value = "")]
        description: String,
        /// Role to assign (architect, devops, qa, frontend, research).
        #[arg(long)]
        role: Option<String>,
        #[command(flatten)]
        exec: commands::ExecArgs,
    },

    /// Show the plan for a request without running it.
    Plan {
        request: String,
        /// Print the plan as JSON.
        #[arg(long)]
        json: bool,
        /// Skip the planner and use the built-in plans.
        #[arg(long)]
        simulate: bool,
    },

    /// List the host tools agents will be told about.
    Arsenal,

    /// Print the status snapshot of a running or finished instance.
    Status {
        /// Snapshot file (default: the current instance's status file).
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { request, exec } => {
            commands::run::run_request(cli.config.as_deref(), cli.json_logs, &request, &exec).await
        }
        Commands::Task {
            title,
            command,
            description,
            role,
            exec,
        } => {
            let new_task = commands::run::NewTask {
                title,
                command,
                description,
                role,
            };
            commands::run::run_task(cli.config.as_deref(), cli.json_logs, new_task, &exec).await
        }
        Commands::Plan {
            request,
            json,
            simulate,
        } => commands::plan::run(cli.config.as_deref(), cli.json_logs, &request, json, simulate).await,
        Commands::Arsenal => commands::arsenal::run(),
        Commands::Status { file } => commands::status::run(cli.config.as_deref(), file),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            if err.chain().any(|e| e.downcast_ref::<ConfigError>().is_some()) {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
