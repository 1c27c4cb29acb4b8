use std::path::Path;
use std::sync::Arc;

use sq_agents::analyzer::{recommend_mode, AnalyzerSettings, TaskAnalyzer};
use sq_agents::runner::ProcessRunner;
use sq_core::cancel::CancelToken;

use super::{cancel_on_ctrl_c, init_logging, load_config};

/// Run the `plan` subcommand: analyze a request and print the plan.
pub async fn run(
    config_path: Option<&Path>,
    json_logs: bool,
    request: &str,
    json: bool,
    simulate: bool,
) -> anyhow::Result<u8> {
    let mut config = load_config(config_path)?;
    if simulate {
        config.execution.use_real_agents = false;
    }
    init_logging(&config, json_logs);

    let analyzer = TaskAnalyzer::new(Arc::new(ProcessRunner::new()), AnalyzerSettings::from_config(&config));
    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let plan = analyzer.analyze(request, &cancel).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }

    println!("Goal:       {}", plan.main_goal);
    println!("Complexity: {:?}", plan.complexity);
    println!("Source:     {:?}", plan.source);
    println!("Mode:       {} (recommended)", recommend_mode(&plan).as_str());
    println!("Estimate:   {:.1}h", plan.total_estimated_hours());
    if let Some(notes) = &plan.notes {
        println!("Notes:      {notes}");
    }
    println!("{}", "-".repeat(60));
    for (i, task) in plan.children().iter().enumerate() {
        let deps: Vec<String> = task
            .depends_on
            .iter()
            .filter_map(|d| plan.children().iter().position(|t| t.id == *d))
            .map(|p| (p + 1).to_string())
            .collect();
        let role = task.assigned_to.map(|r| r.as_str()).unwrap_or("-");
        println!(
            "{:>2}. {}  [{}, {}, {}, {:.1}h]",
            i + 1,
            task.title,
            task.task_type.as_str(),
            task.priority.as_str(),
            role,
            task.estimated_hours
        );
        if !deps.is_empty() {
            println!("      after: {}", deps.join(", "));
        }
    }
    Ok(0)
}
