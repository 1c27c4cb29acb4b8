use std::path::{Path, PathBuf};

use anyhow::Context;
use sq_core::environment::{RuntimeEnv, RuntimePaths};
use sq_core::status::{read_snapshot, StatusSnapshot};

use super::load_config;

/// Run the `status` subcommand: read the snapshot file and pretty-print it.
pub fn run(config_path: Option<&Path>, file: Option<PathBuf>) -> anyhow::Result<u8> {
    let path = match file {
        Some(path) => path,
        None => {
            let config = load_config(config_path)?;
            RuntimePaths::resolve(&config, &RuntimeEnv::from_env()).status_file
        }
    };
    let snapshot = read_snapshot(&path)
        .with_context(|| format!("no readable status snapshot at {}", path.display()))?;
    print!("{}", render(&snapshot));
    Ok(0)
}

fn render(snapshot: &StatusSnapshot) -> String {
    let mut out = String::new();
    let mode = snapshot.mode.as_deref().unwrap_or("-");
    out.push_str(&format!(
        "squadron status  (instance {}, mode {mode})\n",
        snapshot.instance_id
    ));
    out.push_str(&format!("updated:      {}\n", snapshot.updated_at.to_rfc3339()));
    out.push_str(&format!("{}\n", "-".repeat(40)));
    let stats = &snapshot.stats;
    out.push_str(&format!("tasks:        {}\n", stats.total));
    out.push_str(&format!("  completed:  {}\n", stats.completed));
    out.push_str(&format!("  failed:     {}\n", stats.failed));
    out.push_str(&format!("  running:    {}\n", stats.in_progress));
    out.push_str(&format!("  pending:    {}\n", stats.pending));
    out.push_str(&format!("files:        {}\n", stats.files_modified));
    for (name, agent) in &snapshot.agents {
        let current = agent
            .current_task
            .map(|id| id.to_string()[..8].to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "agent {name:<10} {:?}  task {current}  done {} failed {}\n",
            agent.status, agent.tasks_completed, agent.tasks_failed
        ));
    }
    if let Some(last) = snapshot.logs.last() {
        out.push_str(&format!("last event:   [{}] {}\n", last.agent, last.message));
    }
    out
}
